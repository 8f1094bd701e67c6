//! Configuration for the keychain.
//!
//! Values are loaded with priority: env var > default. `.env` files are
//! folded into the environment early in startup by [`crate::bootstrap`].

pub(crate) mod helpers;

use std::path::PathBuf;
use std::time::Duration;

use crate::channel::Origin;
use crate::error::ConfigError;
use crate::gateway::Fee;

use self::helpers::{list_env, optional_env, parse_bool_env, parse_optional_env};

const DEFAULT_SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_MAX_SESSION_TTL_SECS: u64 = 365 * 24 * 60 * 60;
const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 9787;

fn normalize_variant(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

/// Main configuration.
#[derive(Debug, Clone)]
pub struct KeychainConfig {
    pub storage: StorageConfig,
    pub session: SessionConfig,
    pub channel: ChannelConfig,
    pub callback: CallbackConfig,
    pub signer: SignerConfig,
    pub log_format: LogFormat,
}

impl KeychainConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            storage: StorageConfig::resolve()?,
            session: SessionConfig::resolve()?,
            channel: ChannelConfig::resolve()?,
            callback: CallbackConfig::resolve()?,
            signer: SignerConfig::resolve()?,
            log_format: LogFormat::parse(
                &optional_env("KEYCHAIN_LOG_FORMAT")?.unwrap_or_else(|| "pretty".to_string()),
                "KEYCHAIN_LOG_FORMAT",
            )?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'pretty' or 'json', got '{value}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    File,
    LibSql,
}

impl StorageBackend {
    fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "file" | "json" => Ok(Self::File),
            "libsql" | "sqlite" => Ok(Self::LibSql),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'memory', 'file', or 'libsql', got '{value}'"),
            }),
        }
    }

    fn default_file_name(self) -> &'static str {
        match self {
            Self::LibSql => "keychain.db",
            Self::Memory | Self::File => "keychain.json",
        }
    }
}

/// Where session grants are persisted.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

impl StorageConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let backend = StorageBackend::parse(
            &optional_env("KEYCHAIN_STORAGE_BACKEND")?.unwrap_or_else(|| "file".to_string()),
            "KEYCHAIN_STORAGE_BACKEND",
        )?;
        let path = optional_env("KEYCHAIN_STORAGE_PATH")?
            .map(PathBuf::from)
            .unwrap_or_else(|| crate::storage::default_keychain_dir().join(backend.default_file_name()));
        Ok(Self { backend, path })
    }
}

/// Session grant defaults and limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifetime of a session when the consent does not choose one.
    pub default_ttl: Duration,
    /// Upper bound on any session lifetime.
    pub max_ttl: Duration,
    pub guardian_guid: String,
    /// Estimate fees before executing when the caller supplies none.
    pub estimate_fees: bool,
    /// Fee cap applied when the consent does not set one.
    pub default_max_fee: Option<Fee>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            max_ttl: Duration::from_secs(DEFAULT_MAX_SESSION_TTL_SECS),
            guardian_guid: "0x0".to_string(),
            estimate_fees: true,
            default_max_fee: None,
        }
    }
}

impl SessionConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let default_ttl = parse_optional_env::<u64>("KEYCHAIN_SESSION_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.default_ttl);
        let max_ttl = parse_optional_env::<u64>("KEYCHAIN_MAX_SESSION_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_ttl);

        if default_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "KEYCHAIN_SESSION_TTL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if default_ttl > max_ttl {
            return Err(ConfigError::InvalidValue {
                key: "KEYCHAIN_SESSION_TTL_SECS".to_string(),
                message: format!(
                    "{}s exceeds KEYCHAIN_MAX_SESSION_TTL_SECS ({}s)",
                    default_ttl.as_secs(),
                    max_ttl.as_secs()
                ),
            });
        }

        Ok(Self {
            default_ttl,
            max_ttl,
            guardian_guid: optional_env("KEYCHAIN_GUARDIAN_GUID")?
                .unwrap_or(defaults.guardian_guid),
            estimate_fees: parse_bool_env("KEYCHAIN_ESTIMATE_FEES", defaults.estimate_fees)?,
            default_max_fee: parse_optional_env::<Fee>("KEYCHAIN_DEFAULT_MAX_FEE")?,
        })
    }
}

/// Channel host configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub host: String,
    pub port: u16,
    /// Embedding origins allowed to open a channel.
    pub allowed_origins: Vec<Origin>,
    /// Post replies with `targetOrigin = "*"` (legacy embedders only).
    pub allow_wildcard_target_origin: bool,
}

impl ChannelConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let allowed_origins = list_env("KEYCHAIN_ALLOWED_ORIGINS")?
            .iter()
            .map(|raw| {
                Origin::parse(raw).map_err(|e| ConfigError::InvalidValue {
                    key: "KEYCHAIN_ALLOWED_ORIGINS".to_string(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            host: optional_env("KEYCHAIN_HOST")?.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_optional_env::<u16>("KEYCHAIN_PORT")?.unwrap_or(DEFAULT_PORT),
            allowed_origins,
            allow_wildcard_target_origin: parse_bool_env(
                "KEYCHAIN_ALLOW_WILDCARD_TARGET_ORIGIN",
                false,
            )?,
        })
    }
}

/// Session callback delivery configuration.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// `host[/path-prefix]` entries a `callback_uri` must match.
    pub allowlist: Vec<String>,
    pub timeout: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_CALLBACK_TIMEOUT_SECS),
        }
    }
}

impl CallbackConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            allowlist: list_env("KEYCHAIN_CALLBACK_ALLOWLIST")?,
            timeout: parse_optional_env::<u64>("KEYCHAIN_CALLBACK_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(DEFAULT_CALLBACK_TIMEOUT_SECS)),
        })
    }
}

/// External signer endpoint.
#[derive(Debug, Clone, Default)]
pub struct SignerConfig {
    pub url: Option<String>,
}

impl SignerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let url = optional_env("KEYCHAIN_SIGNER_URL")?;
        if let Some(ref raw) = url {
            url::Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
                key: "KEYCHAIN_SIGNER_URL".to_string(),
                message: format!("must be a valid URL: {e}"),
            })?;
        }
        Ok(Self { url })
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    /// Serializes env-mutating tests to prevent parallel races.
    static ENV_MUTEX: AsyncMutex<()> = AsyncMutex::const_new(());

    const KEYS: &[&str] = &[
        "KEYCHAIN_STORAGE_BACKEND",
        "KEYCHAIN_STORAGE_PATH",
        "KEYCHAIN_SESSION_TTL_SECS",
        "KEYCHAIN_MAX_SESSION_TTL_SECS",
        "KEYCHAIN_GUARDIAN_GUID",
        "KEYCHAIN_ESTIMATE_FEES",
        "KEYCHAIN_DEFAULT_MAX_FEE",
        "KEYCHAIN_ALLOWED_ORIGINS",
        "KEYCHAIN_ALLOW_WILDCARD_TARGET_ORIGIN",
        "KEYCHAIN_HOST",
        "KEYCHAIN_PORT",
        "KEYCHAIN_CALLBACK_ALLOWLIST",
        "KEYCHAIN_CALLBACK_TIMEOUT_SECS",
        "KEYCHAIN_SIGNER_URL",
        "KEYCHAIN_LOG_FORMAT",
    ];

    fn clear_env() {
        for key in KEYS {
            // SAFETY: Serialized by ENV_MUTEX in tests.
            unsafe { std::env::remove_var(key) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: Serialized by ENV_MUTEX in tests.
        unsafe { std::env::set_var(key, value) };
    }

    #[tokio::test]
    async fn defaults_without_env() {
        let _guard = ENV_MUTEX.lock().await;
        clear_env();

        let config = KeychainConfig::from_env().unwrap();
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert!(config.storage.path.ends_with("keychain.json"));
        assert_eq!(
            config.session.default_ttl,
            Duration::from_secs(DEFAULT_SESSION_TTL_SECS)
        );
        assert_eq!(config.session.guardian_guid, "0x0");
        assert!(config.session.estimate_fees);
        assert!(config.channel.allowed_origins.is_empty());
        assert!(!config.channel.allow_wildcard_target_origin);
        assert_eq!(config.channel.port, DEFAULT_PORT);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[tokio::test]
    async fn reads_overrides() {
        let _guard = ENV_MUTEX.lock().await;
        clear_env();
        set_env("KEYCHAIN_STORAGE_BACKEND", "libsql");
        set_env("KEYCHAIN_SESSION_TTL_SECS", "3600");
        set_env("KEYCHAIN_DEFAULT_MAX_FEE", "0x100");
        set_env(
            "KEYCHAIN_ALLOWED_ORIGINS",
            "https://game.example, http://localhost:3000",
        );
        set_env("KEYCHAIN_CALLBACK_ALLOWLIST", "api.game.example/session,*.cartridge.gg");
        set_env("KEYCHAIN_ESTIMATE_FEES", "false");
        set_env("KEYCHAIN_LOG_FORMAT", "json");

        let config = KeychainConfig::from_env().unwrap();
        assert_eq!(config.storage.backend, StorageBackend::LibSql);
        assert!(config.storage.path.ends_with("keychain.db"));
        assert_eq!(config.session.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.session.default_max_fee, Some(Fee(0x100)));
        assert!(!config.session.estimate_fees);
        assert_eq!(config.channel.allowed_origins.len(), 2);
        assert_eq!(config.callback.allowlist.len(), 2);
        assert_eq!(config.log_format, LogFormat::Json);

        clear_env();
    }

    #[tokio::test]
    async fn rejects_invalid_values() {
        let _guard = ENV_MUTEX.lock().await;
        clear_env();

        set_env("KEYCHAIN_PORT", "not-a-port");
        assert!(matches!(
            KeychainConfig::from_env(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "KEYCHAIN_PORT"
        ));
        clear_env();

        set_env("KEYCHAIN_SESSION_TTL_SECS", "10");
        set_env("KEYCHAIN_MAX_SESSION_TTL_SECS", "5");
        assert!(KeychainConfig::from_env().is_err());
        clear_env();

        set_env("KEYCHAIN_ALLOWED_ORIGINS", "not an origin");
        assert!(KeychainConfig::from_env().is_err());
        clear_env();
    }
}
