//! NTAG424 DNA provisioning engine for game-coin identifiers: APDU/secure
//! messaging layer, the three-session provisioning state machine, and a
//! crash-safe key store.

pub mod apdu;
pub mod auth;
pub mod commands;
pub mod crypto;
pub mod error;
pub mod inspector;
pub mod keystore;
pub mod ndef;
pub mod provisioning;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
