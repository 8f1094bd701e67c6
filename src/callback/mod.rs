//! Session callback protocol.
//!
//! After a session is granted, its details are handed back to the caller
//! either by POSTing an encoded payload to an allow-listed `callback_uri` or
//! by appending it to a `redirect_uri` as a query parameter.

mod allowlist;

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::CallbackError;
use crate::policy::ContractAddress;
use crate::session::Session;

pub use self::allowlist::{CallbackAllowlist, DenyReason, host_matches};

/// Query parameter carrying the payload on redirects unless the caller
/// names another.
pub const DEFAULT_REDIRECT_QUERY: &str = "startapp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCallbackPayload {
    pub username: String,
    pub address: ContractAddress,
    pub owner_guid: String,
    pub expires_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub already_registered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_policies_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardian_key_guid: Option<String>,
}

impl SessionCallbackPayload {
    /// Payload describing `session`, including everything needed to verify
    /// the grant.
    pub fn from_session(session: &Session, already_registered: bool) -> Self {
        Self {
            username: session.username.clone(),
            address: session.address.clone(),
            owner_guid: session.owner_guid.clone(),
            expires_at: session.expires_at,
            transaction_hash: session.transaction_hash.clone(),
            already_registered: already_registered.then_some(true),
            allowed_policies_root: Some(session.allowed_policies_root.clone()),
            metadata_hash: Some(session.metadata_hash.clone()),
            session_key_guid: Some(session.session_key_guid.clone()),
            guardian_key_guid: Some(session.guardian_key_guid.clone()),
        }
    }
}

/// JSON, then standard base64 with the padding stripped.
pub fn encode_payload(payload: &SessionCallbackPayload) -> Result<String, CallbackError> {
    let json = serde_json::to_vec(payload).map_err(|e| CallbackError::Encoding(e.to_string()))?;
    Ok(STANDARD_NO_PAD.encode(json))
}

/// Inverse of [`encode_payload`]; padded input is accepted too.
pub fn decode_payload(encoded: &str) -> Result<SessionCallbackPayload, CallbackError> {
    let bytes = STANDARD_NO_PAD
        .decode(encoded.trim().trim_end_matches('='))
        .map_err(|e| CallbackError::Encoding(format!("invalid base64: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| CallbackError::Encoding(format!("invalid payload: {e}")))
}

/// `redirect_uri` with the encoded payload appended as `query_name`.
pub fn redirect_url(
    redirect_uri: &str,
    query_name: &str,
    payload: &SessionCallbackPayload,
) -> Result<String, CallbackError> {
    let mut url = url::Url::parse(redirect_uri)
        .map_err(|e| CallbackError::InvalidUrl(format!("{redirect_uri}: {e}")))?;
    let encoded = encode_payload(payload)?;
    url.query_pairs_mut().append_pair(query_name, &encoded);
    Ok(url.to_string())
}

/// Delivers callback payloads to allow-listed endpoints.
#[derive(Debug, Clone)]
pub struct CallbackClient {
    client: reqwest::Client,
    allowlist: CallbackAllowlist,
}

impl CallbackClient {
    pub fn new(allowlist: CallbackAllowlist, timeout: Duration) -> Result<Self, CallbackError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallbackError::Request(format!("client init failed: {e}")))?;
        Ok(Self { client, allowlist })
    }

    pub fn allowlist(&self) -> &CallbackAllowlist {
        &self.allowlist
    }

    /// Check a redirect target without contacting it.
    pub fn check(&self, uri: &str) -> Result<url::Url, CallbackError> {
        self.allowlist.validate(uri).map_err(|reason| {
            tracing::warn!(uri, %reason, "Callback target rejected");
            CallbackError::Denied(reason.to_string())
        })
    }

    /// POST the encoded payload to `callback_uri` as a `text/plain` body.
    pub async fn post_callback(
        &self,
        callback_uri: &str,
        payload: &SessionCallbackPayload,
    ) -> Result<(), CallbackError> {
        let url = self.check(callback_uri)?;
        let body = encode_payload(payload)?;

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| CallbackError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallbackError::Status {
                status: status.as_u16(),
                body,
            });
        }
        tracing::info!(callback_uri, "Session callback delivered");
        Ok(())
    }
}
