//! Inbound keychain methods, parsed from `(method, params)`.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::KeychainError;
use crate::gateway::Fee;
use crate::policy::{Call, ContractAddress, PolicyInput, TypedData};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default)]
    pub policies: PolicyInput,
    /// Session signer to grant; defaults to the provider's session key.
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterParams {
    #[serde(alias = "public_key")]
    pub public_key: String,
    #[serde(default)]
    pub policies: PolicyInput,
    #[serde(default, alias = "callback_uri")]
    pub callback_uri: Option<String>,
    #[serde(default, alias = "redirect_uri")]
    pub redirect_uri: Option<String>,
    #[serde(default, alias = "redirect_query_name")]
    pub redirect_query_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteParams {
    pub calls: Vec<Call>,
    #[serde(default)]
    pub max_fee: Option<Fee>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignMessageParams {
    pub typed_data: TypedData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDelegateParams {
    #[serde(alias = "address")]
    pub delegate_address: ContractAddress,
}

/// Every method the keychain serves.
#[derive(Debug, Clone)]
pub enum KeychainRequest {
    Connect(ConnectParams),
    Register(RegisterParams),
    Probe,
    Execute(ExecuteParams),
    SignMessage(SignMessageParams),
    DeployContract,
    Logout,
    OpenSettings,
    OpenMenu,
    SetDelegate(SetDelegateParams),
}

impl KeychainRequest {
    pub fn parse(method: &str, params: serde_json::Value) -> Result<Self, KeychainError> {
        let request = match method {
            "connect" => Self::Connect(decode(method, params)?),
            "register" => Self::Register(decode(method, params)?),
            "probe" => Self::Probe,
            "execute" => {
                // `execute(calls)` and `execute({ calls, maxFee })` are both used.
                let params = match params {
                    serde_json::Value::Array(_) => serde_json::json!({ "calls": params }),
                    other => other,
                };
                Self::Execute(decode(method, params)?)
            }
            "sign-message" | "signMessage" => {
                // A bare typed-data object is accepted in place of `{ typedData }`.
                let params = if params.get("domain").is_some() {
                    serde_json::json!({ "typedData": params })
                } else {
                    params
                };
                Self::SignMessage(decode(method, params)?)
            }
            "deploy-contract" | "deploy" => Self::DeployContract,
            "logout" | "disconnect" => Self::Logout,
            "open-settings" | "openSettings" => Self::OpenSettings,
            "open-menu" | "openMenu" => Self::OpenMenu,
            "set-delegate" | "setDelegate" => {
                let params = match params {
                    serde_json::Value::String(address) => {
                        serde_json::json!({ "delegateAddress": address })
                    }
                    other => other,
                };
                Self::SetDelegate(decode(method, params)?)
            }
            other => return Err(KeychainError::UnknownMethod(other.to_string())),
        };
        Ok(request)
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Register(_) => "register",
            Self::Probe => "probe",
            Self::Execute(_) => "execute",
            Self::SignMessage(_) => "sign-message",
            Self::DeployContract => "deploy-contract",
            Self::Logout => "logout",
            Self::OpenSettings => "open-settings",
            Self::OpenMenu => "open-menu",
            Self::SetDelegate(_) => "set-delegate",
        }
    }
}

fn decode<T: DeserializeOwned>(method: &str, params: serde_json::Value) -> Result<T, KeychainError> {
    let params = if params.is_null() {
        serde_json::json!({})
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|e| KeychainError::InvalidRequest(format!("{method}: {e}")))
}
