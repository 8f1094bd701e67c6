//! Bootstrap helpers for the keychain.
//!
//! Settings needed before anything else starts (signer URL, storage backend,
//! allowed origins) can live in `~/.cartridge/.env` in standard dotenvy
//! format.

use std::path::{Path, PathBuf};

use crate::storage::default_keychain_dir;

/// Path to the keychain `.env` file: `~/.cartridge/.env`.
pub fn keychain_env_path() -> PathBuf {
    default_keychain_dir().join(".env")
}

/// Load `./.env`, then `~/.cartridge/.env`.
///
/// dotenvy never overwrites existing env vars, so the effective priority is:
///
///   explicit env vars > `./.env` > `~/.cartridge/.env`
pub fn load_keychain_env() {
    let _ = dotenvy::dotenv();

    let path = keychain_env_path();
    if path.exists() {
        let _ = dotenvy::from_path(&path);
    }
}

/// Write bootstrap vars to `~/.cartridge/.env`, replacing the file.
pub fn save_bootstrap_env(vars: &[(&str, &str)]) -> std::io::Result<PathBuf> {
    let path = keychain_env_path();
    write_env_file(&path, vars)?;
    Ok(path)
}

/// Values are double-quoted so that `#` and other shell-special characters
/// survive a dotenvy round trip.
fn write_env_file(path: &Path, vars: &[(&str, &str)]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut content = String::new();
    for (key, value) in vars {
        // Escape backslashes and quotes so a value cannot break out and
        // define another variable.
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        content.push_str(&format!("{}=\"{}\"\n", key, escaped));
    }
    std::fs::write(path, content)
}
