//! Session policy keychain for Cartridge Controller.
//!
//! A game embeds the keychain in a separate origin and talks to it over a
//! message channel. The keychain asks the user once for a scoped session
//! (which contracts and methods, for how long, up to what fee), stores the
//! grant, and afterwards executes and signs within that scope without asking
//! again.

pub mod bootstrap;
pub mod callback;
pub mod channel;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod host;
pub mod policy;
pub mod session;
pub mod storage;
