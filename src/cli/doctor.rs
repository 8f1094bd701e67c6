//! `cartridge-keychain doctor` - active health diagnostics.
//!
//! Validates configuration and probes storage and the signer endpoint so
//! problems surface before a game tries to connect. Each check reports
//! pass/fail with actionable guidance on failures.

use std::time::Duration;

use crate::callback::CallbackAllowlist;
use crate::config::KeychainConfig;
use crate::error::ConfigError;
use crate::gateway::{AccountProvider, JsonRpcProvider};
use crate::storage::open_store;

const SIGNER_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run diagnostic checks and print results.
pub async fn run_doctor_command(
    config: Result<KeychainConfig, ConfigError>,
    strict: bool,
) -> anyhow::Result<()> {
    println!("Keychain Doctor");
    println!("===============\n");

    let mut passed = 0u32;
    let mut failed = 0u32;

    let config = match config {
        Ok(config) => {
            check(
                "Configuration",
                CheckResult::Pass("environment parsed".to_string()),
                &mut passed,
                &mut failed,
            );
            config
        }
        Err(e) => {
            check(
                "Configuration",
                CheckResult::Fail(e.to_string()),
                &mut passed,
                &mut failed,
            );
            return finish(passed, failed, strict);
        }
    };

    check("Storage", check_storage(&config).await, &mut passed, &mut failed);
    check(
        "Allowed origins",
        check_allowed_origins(&config),
        &mut passed,
        &mut failed,
    );
    check(
        "Channel bind port",
        check_port_available(&config),
        &mut passed,
        &mut failed,
    );
    check(
        "Callback allowlist",
        check_callback_allowlist(&config),
        &mut passed,
        &mut failed,
    );
    check(
        "Signer endpoint",
        check_signer(&config).await,
        &mut passed,
        &mut failed,
    );

    finish(passed, failed, strict)
}

fn finish(passed: u32, failed: u32, strict: bool) -> anyhow::Result<()> {
    println!();
    println!("  {passed} passed, {failed} failed");

    if failed > 0 {
        println!("\n  Some checks failed. This is informational; not all are fatal.");
        if strict {
            anyhow::bail!("doctor strict mode failed with {failed} check(s)");
        }
    }
    Ok(())
}

// ── Individual checks ───────────────────────────────────────

fn check(name: &str, result: CheckResult, passed: &mut u32, failed: &mut u32) {
    match result {
        CheckResult::Pass(detail) => {
            *passed += 1;
            println!("  [pass] {name}: {detail}");
        }
        CheckResult::Fail(detail) => {
            *failed += 1;
            println!("  [FAIL] {name}: {detail}");
        }
        CheckResult::Skip(reason) => {
            println!("  [skip] {name}: {reason}");
        }
    }
}

enum CheckResult {
    Pass(String),
    Fail(String),
    Skip(String),
}

async fn check_storage(config: &KeychainConfig) -> CheckResult {
    match open_store(&config.storage).await {
        Ok(store) => match store.keys().await {
            Ok(keys) => CheckResult::Pass(format!(
                "{:?} at {} ({} keys)",
                config.storage.backend,
                config.storage.path.display(),
                keys.len()
            )),
            Err(e) => CheckResult::Fail(format!("opened but unreadable: {e}")),
        },
        Err(e) => CheckResult::Fail(format!(
            "cannot open {}: {e}",
            config.storage.path.display()
        )),
    }
}

fn check_allowed_origins(config: &KeychainConfig) -> CheckResult {
    let origins = &config.channel.allowed_origins;
    if origins.is_empty() {
        return CheckResult::Fail(
            "none configured; set KEYCHAIN_ALLOWED_ORIGINS to the embedding game's origin"
                .to_string(),
        );
    }
    let listed: Vec<&str> = origins.iter().map(|o| o.as_str()).collect();
    CheckResult::Pass(listed.join(", "))
}

fn check_port_available(config: &KeychainConfig) -> CheckResult {
    let bind_addr = format!("{}:{}", config.channel.host, config.channel.port);
    match std::net::TcpListener::bind(&bind_addr) {
        Ok(listener) => {
            drop(listener);
            CheckResult::Pass(format!("{bind_addr} is available"))
        }
        Err(error) => CheckResult::Fail(format!(
            "{bind_addr} is unavailable ({error}); free the port or change KEYCHAIN_PORT"
        )),
    }
}

fn check_callback_allowlist(config: &KeychainConfig) -> CheckResult {
    let allowlist = CallbackAllowlist::new(&config.callback.allowlist);
    if allowlist.is_empty() {
        CheckResult::Skip("empty; callback_uri and redirect_uri requests will be refused".to_string())
    } else {
        CheckResult::Pass(format!("{} entries", config.callback.allowlist.len()))
    }
}

async fn check_signer(config: &KeychainConfig) -> CheckResult {
    let Some(url) = config.signer.url.as_deref() else {
        return CheckResult::Fail("KEYCHAIN_SIGNER_URL is not set".to_string());
    };
    let provider = match JsonRpcProvider::new(url, SIGNER_PROBE_TIMEOUT) {
        Ok(provider) => provider,
        Err(e) => return CheckResult::Fail(format!("cannot construct HTTP client: {e}")),
    };
    match provider.account().await {
        Ok(account) => CheckResult::Pass(format!(
            "{} ({} @ {})",
            redact_url_for_display(url),
            account.username,
            account.address.short()
        )),
        Err(e) => CheckResult::Fail(format!(
            "{} did not answer keychain_account: {e}",
            redact_url_for_display(url)
        )),
    }
}

fn redact_url_for_display(raw: &str) -> String {
    match reqwest::Url::parse(raw) {
        Ok(mut url) => {
            if !url.username().is_empty() {
                let _ = url.set_username("redacted");
            }
            if url.password().is_some() {
                let _ = url.set_password(Some("redacted"));
            }
            url.to_string()
        }
        Err(_) => "<invalid-url>".to_string(),
    }
}
