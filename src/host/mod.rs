//! Network host for the keychain channel.

pub mod server;
mod ws;

pub use self::server::{HostState, start_server};
