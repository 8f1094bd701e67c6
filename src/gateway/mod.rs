//! Execution gateway: policy-checked access to the external account.
//!
//! The gateway never holds keys. It checks a [`Session`]'s scope and fee
//! cap, attaches Merkle proofs for the granted policies, and forwards to an
//! [`AccountProvider`], which owns signing and chain access.

mod rpc;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{GatewayError, KeychainError, ProviderError};
use crate::policy::{Call, ContractAddress, Policy, TypedData, diff, merkle_proof};
use crate::session::Session;

pub use self::rpc::JsonRpcProvider;

/// Fee amount in the chain's smallest unit.
///
/// Serialized as a `0x` hex string; parsed from hex strings, decimal strings
/// or JSON integers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fee(pub u128);

#[derive(Debug, thiserror::Error)]
#[error("invalid fee '{0}'")]
pub struct InvalidFee(String);

impl FromStr for Fee {
    type Err = InvalidFee;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u128::from_str_radix(hex, 16),
            None => trimmed.parse::<u128>(),
        };
        parsed.map(Fee).map_err(|_| InvalidFee(s.to_string()))
    }
}

impl fmt::Display for Fee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl Serialize for Fee {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fee {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Fee(u128::from(n))),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// The controller account behind the keychain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountIdentity {
    pub username: String,
    pub address: ContractAddress,
    pub owner_guid: String,
}

/// On-chain registration of a session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub public_key: String,
    pub expires_at: u64,
    pub allowed_policies_root: String,
    pub metadata_hash: String,
    pub session_key_guid: String,
    pub guardian_key_guid: String,
    pub policies: Vec<Policy>,
}

/// Proof material letting the account accept a session signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAuthorization {
    pub public_key: String,
    pub allowed_policies_root: String,
    /// One Merkle proof per call (or one for a message).
    pub proofs: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub calls: Vec<Call>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee: Option<Fee>,
    /// `None` for a manually approved transaction signed by the owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionAuthorization>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
    pub transaction_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeEstimate {
    pub overall_fee: Fee,
}

/// The external account/provider the keychain drives.
#[async_trait]
pub trait AccountProvider: Send + Sync {
    async fn account(&self) -> Result<AccountIdentity, ProviderError>;

    /// Public key of the locally held session signer.
    async fn session_public_key(&self) -> Result<String, ProviderError>;

    async fn execute(&self, request: &ExecutionRequest) -> Result<TransactionResult, ProviderError>;

    async fn estimate_fee(&self, calls: &[Call]) -> Result<FeeEstimate, ProviderError>;

    async fn sign_message(
        &self,
        typed_data: &TypedData,
        session: Option<&SessionAuthorization>,
    ) -> Result<Vec<String>, ProviderError>;

    async fn register_session(&self, grant: &SessionGrant)
    -> Result<TransactionResult, ProviderError>;

    async fn deploy(&self) -> Result<TransactionResult, ProviderError>;
}

/// Applies session scope and fee rules before touching the provider.
#[derive(Clone)]
pub struct ExecutionGateway {
    provider: Arc<dyn AccountProvider>,
    estimate_fees: bool,
}

impl ExecutionGateway {
    pub fn new(provider: Arc<dyn AccountProvider>, estimate_fees: bool) -> Self {
        Self {
            provider,
            estimate_fees,
        }
    }

    pub fn provider(&self) -> &Arc<dyn AccountProvider> {
        &self.provider
    }

    /// Execute `calls` under `session`.
    ///
    /// Fails with `MissingScopes` when any call is outside the session's
    /// authorized policies and `FeeExceeded` when the fee is above the
    /// session cap. The fee is never lowered to fit.
    pub async fn execute(
        &self,
        session: &Session,
        calls: &[Call],
        max_fee: Option<Fee>,
    ) -> Result<TransactionResult, KeychainError> {
        let required: Vec<Policy> = calls.iter().map(Call::required_policy).collect();
        let missing = diff(&required, &session.policies);
        if !missing.is_empty() {
            tracing::info!(
                session = %session.public_key,
                missing = missing.len(),
                "Execute rejected for missing scopes"
            );
            return Err(KeychainError::MissingScopes { scopes: missing });
        }

        let fee = match max_fee {
            Some(fee) => Some(fee),
            None if self.estimate_fees => Some(
                self.provider
                    .estimate_fee(calls)
                    .await
                    .map_err(GatewayError::Estimation)?
                    .overall_fee,
            ),
            None => None,
        };
        if let (Some(requested), Some(limit)) = (fee, session.max_fee)
            && requested > limit
        {
            return Err(KeychainError::FeeExceeded { requested, limit });
        }
        // Without an estimate the session cap is the limit the signer gets.
        let fee = fee.or(session.max_fee);

        let authorization = authorize(session, &required)?;
        let request = ExecutionRequest {
            calls: calls.to_vec(),
            max_fee: fee,
            session: Some(authorization),
        };
        let result = self
            .provider
            .execute(&request)
            .await
            .map_err(GatewayError::Execution)?;
        tracing::info!(
            session = %session.public_key,
            calls = calls.len(),
            transaction_hash = %result.transaction_hash,
            "Session transaction submitted"
        );
        Ok(result)
    }

    /// Sign `typed_data` under `session`; the message is passed through as is.
    pub async fn sign_message(
        &self,
        session: &Session,
        typed_data: &TypedData,
    ) -> Result<Vec<String>, KeychainError> {
        let required = vec![typed_data.required_policy()?];
        let missing = diff(&required, &session.policies);
        if !missing.is_empty() {
            return Err(KeychainError::MissingScopes { scopes: missing });
        }

        let authorization = authorize(session, &required)?;
        Ok(self
            .provider
            .sign_message(typed_data, Some(&authorization))
            .await
            .map_err(GatewayError::Signing)?)
    }

    /// Execute a transaction the user approved by hand, outside any session.
    pub async fn execute_unchecked(
        &self,
        calls: &[Call],
        max_fee: Option<Fee>,
    ) -> Result<TransactionResult, KeychainError> {
        let request = ExecutionRequest {
            calls: calls.to_vec(),
            max_fee,
            session: None,
        };
        Ok(self
            .provider
            .execute(&request)
            .await
            .map_err(GatewayError::Execution)?)
    }

    /// Sign a message the user approved by hand, outside any session.
    pub async fn sign_unchecked(&self, typed_data: &TypedData) -> Result<Vec<String>, KeychainError> {
        Ok(self
            .provider
            .sign_message(typed_data, None)
            .await
            .map_err(GatewayError::Signing)?)
    }
}

fn authorize(session: &Session, required: &[Policy]) -> Result<SessionAuthorization, KeychainError> {
    let mut proofs = Vec::with_capacity(required.len());
    for policy in required {
        match merkle_proof(&session.policies, &policy.id())? {
            Some(proof) => proofs.push(proof),
            None => {
                return Err(KeychainError::MissingScopes {
                    scopes: vec![policy.clone()],
                });
            }
        }
    }
    Ok(SessionAuthorization {
        public_key: session.public_key.clone(),
        allowed_policies_root: session.allowed_policies_root.clone(),
        proofs,
    })
}
