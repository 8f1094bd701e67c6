//! JSON-RPC 2.0 client for an external signer/account service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::ProviderError;
use crate::gateway::{
    AccountIdentity, AccountProvider, ExecutionRequest, FeeEstimate, SessionAuthorization,
    SessionGrant, TransactionResult,
};
use crate::policy::{Call, TypedData};

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// [`AccountProvider`] backed by `keychain_*` JSON-RPC methods.
pub struct JsonRpcProvider {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcProvider {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transport(format!("client init failed: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<R, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("{} unreachable: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Transport(format!(
                "{} returned HTTP {}: {}",
                self.url, status, text
            )));
        }

        let envelope: RpcResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("{method}: {e}")))?;
        if let Some(error) = envelope.error {
            tracing::debug!(method, code = error.code, message = %error.message, "Provider returned error");
            return Err(ProviderError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        serde_json::from_value(envelope.result.unwrap_or(serde_json::Value::Null))
            .map_err(|e| ProviderError::InvalidResponse(format!("{method}: {e}")))
    }
}

#[async_trait]
impl AccountProvider for JsonRpcProvider {
    async fn account(&self) -> Result<AccountIdentity, ProviderError> {
        self.request("keychain_account", json!([])).await
    }

    async fn session_public_key(&self) -> Result<String, ProviderError> {
        self.request("keychain_sessionPublicKey", json!([])).await
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<TransactionResult, ProviderError> {
        self.request("keychain_execute", json!([request])).await
    }

    async fn estimate_fee(&self, calls: &[Call]) -> Result<FeeEstimate, ProviderError> {
        self.request("keychain_estimateFee", json!([calls])).await
    }

    async fn sign_message(
        &self,
        typed_data: &TypedData,
        session: Option<&SessionAuthorization>,
    ) -> Result<Vec<String>, ProviderError> {
        self.request("keychain_signMessage", json!([typed_data, session]))
            .await
    }

    async fn register_session(
        &self,
        grant: &SessionGrant,
    ) -> Result<TransactionResult, ProviderError> {
        self.request("keychain_registerSession", json!([grant])).await
    }

    async fn deploy(&self) -> Result<TransactionResult, ProviderError> {
        self.request("keychain_deploy", json!([])).await
    }
}
