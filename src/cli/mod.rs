//! Command-line interface.

mod doctor;
mod serve;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::KeychainConfig;
use crate::error::ConfigError;
use crate::policy::{PolicyInput, PolicySet, merkle_root};
use crate::session::{Session, SessionRegistry, SystemClock};
use crate::storage::open_store;

pub use self::doctor::run_doctor_command;
pub use self::serve::run_serve;

#[derive(Parser, Debug)]
#[command(
    name = "cartridge-keychain",
    version,
    about = "Session policy keychain for Cartridge Controller"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the keychain channel over WebSocket.
    Serve {
        /// Refuse every request that needs consent instead of prompting.
        #[arg(long)]
        headless: bool,
    },
    /// Print the fingerprint and Merkle root of a policy file.
    Fingerprint {
        /// JSON file holding a policy list or grouped session policies.
        file: PathBuf,
    },
    /// List stored sessions.
    Sessions {
        #[arg(long)]
        json: bool,
    },
    /// Forget every stored session.
    Logout,
    /// Check configuration, storage and the signer endpoint.
    Doctor {
        /// Exit non-zero when any check fails.
        #[arg(long)]
        strict: bool,
    },
    /// Write bootstrap settings to `~/.cartridge/.env`.
    Init {
        #[arg(long)]
        signer_url: String,
        /// Embedding origin allowed to open a channel (repeatable).
        #[arg(long = "allowed-origin")]
        allowed_origins: Vec<String>,
        /// `host[/path-prefix]` a callback may target (repeatable).
        #[arg(long = "callback-host")]
        callback_hosts: Vec<String>,
    },
}

/// Run `command`. `config` is only required by commands that use it.
pub async fn run(command: Command, config: Result<KeychainConfig, ConfigError>) -> anyhow::Result<()> {
    match command {
        Command::Serve { headless } => run_serve(config?, headless).await,
        Command::Fingerprint { file } => run_fingerprint(&file),
        Command::Sessions { json } => run_sessions(config?, json).await,
        Command::Logout => run_logout(config?).await,
        Command::Doctor { strict } => run_doctor_command(config, strict).await,
        Command::Init {
            signer_url,
            allowed_origins,
            callback_hosts,
        } => run_init(&signer_url, &allowed_origins, &callback_hosts),
    }
}

fn run_fingerprint(file: &PathBuf) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let input: PolicyInput = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a policy list", file.display()))?;
    let set: PolicySet = input.into();
    let normalized = set.normalize();

    println!("fingerprint: {}", set.fingerprint()?);
    println!("merkle root: {}", merkle_root(&set.authorized_only().policies)?);
    println!("verified:    {}", normalized.verified);
    for policy in &normalized.policies {
        let marker = if policy.is_authorized() { "+" } else { "-" };
        println!("  {marker} {}", policy.describe());
    }
    Ok(())
}

async fn open_registry(config: &KeychainConfig) -> anyhow::Result<SessionRegistry> {
    let store = open_store(&config.storage)
        .await
        .with_context(|| format!("failed to open {}", config.storage.path.display()))?;
    Ok(SessionRegistry::new(store, Arc::new(SystemClock)))
}

async fn run_sessions(config: KeychainConfig, json: bool) -> anyhow::Result<()> {
    let registry = open_registry(&config).await?;
    let sessions = registry.sessions().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No stored sessions.");
        return Ok(());
    }
    let now = registry.now();
    for session in &sessions {
        println!("{}", describe_session(session, now));
    }
    Ok(())
}

fn describe_session(session: &Session, now: u64) -> String {
    let status = if session.is_expired_at(now) {
        "expired"
    } else {
        "live"
    };
    let expires = i64::try_from(session.expires_at)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| session.expires_at.to_string());
    format!(
        "{} [{status}] {} @ {} for {} ({} policies, expires {expires})",
        session.public_key,
        session.username,
        session.address.short(),
        session.origin,
        session.policies.len(),
    )
}

async fn run_logout(config: KeychainConfig) -> anyhow::Result<()> {
    let registry = open_registry(&config).await?;
    let sessions = registry.sessions().await?;
    for session in &sessions {
        registry.invalidate(&session.public_key).await?;
    }
    registry.clear().await?;
    println!("Removed {} session(s).", sessions.len());
    Ok(())
}

fn run_init(signer_url: &str, allowed_origins: &[String], callback_hosts: &[String]) -> anyhow::Result<()> {
    url::Url::parse(signer_url).with_context(|| format!("invalid signer URL: {signer_url}"))?;
    for origin in allowed_origins {
        crate::channel::Origin::parse(origin)?;
    }

    let origins = allowed_origins.join(",");
    let hosts = callback_hosts.join(",");
    let mut vars = vec![("KEYCHAIN_SIGNER_URL", signer_url)];
    if !origins.is_empty() {
        vars.push(("KEYCHAIN_ALLOWED_ORIGINS", origins.as_str()));
    }
    if !hosts.is_empty() {
        vars.push(("KEYCHAIN_CALLBACK_ALLOWLIST", hosts.as_str()));
    }

    let path = crate::bootstrap::save_bootstrap_env(&vars)?;
    println!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Origin;
    use crate::policy::ContractAddress;

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["cartridge-keychain", "serve", "--headless"]).unwrap();
        assert!(matches!(cli.command, Command::Serve { headless: true }));

        let cli = Cli::try_parse_from([
            "cartridge-keychain",
            "init",
            "--signer-url",
            "http://127.0.0.1:5050",
            "--allowed-origin",
            "https://a.example",
            "--allowed-origin",
            "https://b.example",
        ])
        .unwrap();
        let Command::Init {
            allowed_origins, ..
        } = cli.command
        else {
            panic!("expected init");
        };
        assert_eq!(allowed_origins.len(), 2);

        assert!(Cli::try_parse_from(["cartridge-keychain", "fingerprint"]).is_err());
    }

    #[test]
    fn fingerprint_reads_policy_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.json");
        std::fs::write(&path, r#"[{ "target": "0xaaa", "method": "transfer" }]"#).unwrap();
        run_fingerprint(&path).unwrap();

        std::fs::write(&path, "not json").unwrap();
        assert!(run_fingerprint(&path).is_err());
    }

    #[test]
    fn session_line_marks_expiry() {
        let session = Session {
            public_key: "0x5e55".to_string(),
            address: ContractAddress::parse("0xabc").unwrap(),
            username: "player".to_string(),
            owner_guid: "0x0123".to_string(),
            origin: Origin::parse("https://game.example").unwrap(),
            policy_fingerprint: "fp".to_string(),
            allowed_policies_root: "0x0".to_string(),
            policies: Vec::new(),
            expires_at: 100,
            session_key_guid: "0x1".to_string(),
            guardian_key_guid: "0x0".to_string(),
            metadata_hash: "0x2".to_string(),
            max_fee: None,
            transaction_hash: None,
            created_at: 0,
        };
        assert!(describe_session(&session, 99).contains("[live]"));
        assert!(describe_session(&session, 100).contains("[expired]"));
        assert!(describe_session(&session, 100).contains("0xabc"));
    }
}
