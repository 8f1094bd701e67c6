use clap::Parser;
use tracing_subscriber::EnvFilter;

use cartridge_keychain::bootstrap::load_keychain_env;
use cartridge_keychain::cli::{Cli, run};
use cartridge_keychain::config::{KeychainConfig, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_keychain_env();
    let cli = Cli::parse();

    let config = KeychainConfig::from_env();
    let format = config
        .as_ref()
        .map(|c| c.log_format)
        .unwrap_or(LogFormat::Pretty);
    init_tracing(format);

    run(cli.command, config).await
}

/// Logs go to stderr so command output on stdout stays parseable.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cartridge_keychain=info,tower_http=warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}
