//! `cartridge-keychain serve`: run the channel host until Ctrl-C.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::callback::{CallbackAllowlist, CallbackClient};
use crate::config::KeychainConfig;
use crate::controller::{ConsentPrompt, HeadlessConsent, KeychainController, TerminalConsent};
use crate::gateway::{ExecutionGateway, JsonRpcProvider};
use crate::host::{HostState, start_server};
use crate::session::{SessionRegistry, SystemClock};
use crate::storage::open_store;

const SIGNER_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run_serve(config: KeychainConfig, headless: bool) -> anyhow::Result<()> {
    let signer_url = config
        .signer
        .url
        .clone()
        .context("KEYCHAIN_SIGNER_URL is required to serve")?;
    if config.channel.allowed_origins.is_empty() {
        anyhow::bail!("KEYCHAIN_ALLOWED_ORIGINS must name at least one embedding origin");
    }

    let store = open_store(&config.storage)
        .await
        .with_context(|| format!("failed to open {}", config.storage.path.display()))?;
    let registry = Arc::new(SessionRegistry::new(store, Arc::new(SystemClock)));

    let provider = Arc::new(JsonRpcProvider::new(signer_url, SIGNER_TIMEOUT)?);
    let gateway = ExecutionGateway::new(provider, config.session.estimate_fees);

    let consent: Arc<dyn ConsentPrompt> = if headless {
        Arc::new(HeadlessConsent)
    } else {
        Arc::new(TerminalConsent)
    };

    let allowlist = CallbackAllowlist::new(&config.callback.allowlist);
    if allowlist.is_empty() {
        tracing::warn!("Callback allowlist is empty; callback_uri requests will be refused");
    }
    let callbacks = CallbackClient::new(allowlist, config.callback.timeout)?;

    let controller = Arc::new(KeychainController::new(
        registry,
        gateway,
        consent,
        callbacks,
        config.session.clone(),
    ));

    let mut states = controller.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            tracing::info!(?state, "Authorization state changed");
        }
    });

    let ip: IpAddr = config
        .channel
        .host
        .parse()
        .with_context(|| format!("KEYCHAIN_HOST must be an IP address, got {}", config.channel.host))?;
    let state = Arc::new(HostState::new(
        controller,
        config.channel.allowed_origins.clone(),
        config.channel.allow_wildcard_target_origin,
    ));
    let bound = start_server(SocketAddr::new(ip, config.channel.port), Arc::clone(&state)).await?;

    eprintln!("Keychain listening on ws://{bound}/channel");
    for origin in &config.channel.allowed_origins {
        eprintln!("  allowed origin: {origin}");
    }
    if headless {
        eprintln!("  headless: requests needing consent will be refused");
    }

    tokio::signal::ctrl_c().await?;
    state.shutdown().await;
    Ok(())
}
