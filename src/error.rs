//! Error types for the keychain.
//!
//! Internal code returns these as `Result` values. Only the outermost
//! request handler converts a [`KeychainError`] into a [`WireError`], which
//! is the sole error shape that ever crosses the channel boundary.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gateway::Fee;
use crate::policy::Policy;

/// Response codes surfaced to the embedding application.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Canceled,
    UserInteractionRequired,
    MissingScopes,
    FeeLimitExceeded,
    UnknownMethod,
    InvalidRequest,
    Error,
}

/// Pipeline stage of an upstream (provider) failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Account,
    Estimation,
    Execution,
    Signing,
    Registration,
    Deployment,
}

/// Structured error payload carried in a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    pub code: ResponseCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<Policy>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<FailureStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl WireError {
    pub fn new(code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            scopes: None,
            stage: None,
            data: None,
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<Policy>) -> Self {
        self.scopes = Some(scopes);
        self
    }

    pub fn with_stage(mut self, stage: FailureStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = serde_json::to_value(self.code)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self.code));
        write!(f, "{}: {}", code, self.message)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage IO failed for {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Storage serialization error: {0}")]
    Serialization(String),

    #[error("Storage query failed: {0}")]
    Query(String),

    #[error("Storage connection error: {0}")]
    Connection(String),

    #[cfg(feature = "libsql")]
    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Cross-window channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel destroyed before a response arrived")]
    Destroyed,

    #[error("Channel call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid origin: {0}")]
    InvalidOrigin(String),

    #[error("Failed to post message: {0}")]
    SendFailed(String),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Remote error: {0}")]
    Remote(WireError),

    #[error("Channel host failed to start: {0}")]
    StartupFailed(String),
}

/// Policy parsing and hashing errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Invalid contract address '{0}'")]
    InvalidAddress(String),

    #[error("Policy method name cannot be empty")]
    EmptyMethod,

    #[error("Invalid typed data: {0}")]
    InvalidTypedData(String),

    #[error("Invalid hash '{0}'")]
    InvalidHash(String),

    #[error("Policy serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Session callback delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("Invalid callback URL: {0}")]
    InvalidUrl(String),

    #[error("Callback URL not allowed: {0}")]
    Denied(String),

    #[error("Callback payload encoding failed: {0}")]
    Encoding(String),

    #[error("Callback request failed: {0}")]
    Request(String),

    #[error("Callback endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Failure reported by the external account/provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{0}")]
    Transport(String),

    #[error("{message}")]
    Rpc { code: i64, message: String },

    #[error("{0}")]
    InvalidResponse(String),
}

/// Execution gateway errors, tagged by the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Account lookup failed: {0}")]
    Account(ProviderError),

    #[error("Fee estimation failed: {0}")]
    Estimation(ProviderError),

    #[error("Execution failed: {0}")]
    Execution(ProviderError),

    #[error("Signing failed: {0}")]
    Signing(ProviderError),

    #[error("Session registration failed: {0}")]
    Registration(ProviderError),

    #[error("Deployment failed: {0}")]
    Deployment(ProviderError),
}

impl GatewayError {
    pub fn stage(&self) -> FailureStage {
        match self {
            Self::Account(_) => FailureStage::Account,
            Self::Estimation(_) => FailureStage::Estimation,
            Self::Execution(_) => FailureStage::Execution,
            Self::Signing(_) => FailureStage::Signing,
            Self::Registration(_) => FailureStage::Registration,
            Self::Deployment(_) => FailureStage::Deployment,
        }
    }

    pub fn provider_error(&self) -> &ProviderError {
        match self {
            Self::Account(e)
            | Self::Estimation(e)
            | Self::Execution(e)
            | Self::Signing(e)
            | Self::Registration(e)
            | Self::Deployment(e) => e,
        }
    }
}

/// Errors produced while handling a keychain request.
#[derive(Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("User canceled the request")]
    Canceled,

    #[error("User interaction required: {0}")]
    InteractionRequired(String),

    #[error("missing scopes")]
    MissingScopes { scopes: Vec<Policy> },

    #[error("Fee {requested} exceeds pre-approved limit {limit}")]
    FeeExceeded { requested: Fee, limit: Fee },

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl KeychainError {
    /// Convert into the structured payload sent to the calling origin.
    pub fn to_wire(&self) -> WireError {
        match self {
            Self::Canceled => WireError::new(ResponseCode::Canceled, "User canceled"),
            Self::InteractionRequired(reason) => {
                WireError::new(ResponseCode::UserInteractionRequired, reason.clone())
            }
            Self::MissingScopes { scopes } => {
                WireError::new(ResponseCode::MissingScopes, "missing scopes")
                    .with_scopes(scopes.clone())
            }
            Self::FeeExceeded { requested, limit } => {
                WireError::new(ResponseCode::FeeLimitExceeded, self.to_string()).with_data(
                    serde_json::json!({
                        "requested": requested,
                        "limit": limit,
                    }),
                )
            }
            Self::UnknownMethod(_) => WireError::new(ResponseCode::UnknownMethod, self.to_string()),
            Self::InvalidRequest(_) | Self::Policy(_) | Self::Callback(_) => {
                WireError::new(ResponseCode::InvalidRequest, self.to_string())
            }
            Self::Gateway(e) => WireError::new(ResponseCode::Error, e.provider_error().to_string())
                .with_stage(e.stage()),
            Self::Storage(_) | Self::Channel(_) => {
                WireError::new(ResponseCode::Error, self.to_string())
            }
        }
    }
}
