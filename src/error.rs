//! Error taxonomy for the provisioning engine.
//!
//! Kinds are never conflated: a CMAC/padding failure is always
//! [`Error::IntegrityError`], never folded into [`Error::ProtocolError`],
//! because the former indicates a bug in this crate while the latter
//! indicates an unexpected (but not necessarily our fault) tag response.

use thiserror::Error;

/// Status word the tag or reader returned, rendered for diagnostics.
pub type StatusWord = u16;

#[derive(Debug, Error)]
pub enum Error {
    /// `91AE` — wrong key, or `rnda_rot` verification failed.
    #[error("authentication failed ({command}, sw={sw:04X})")]
    AuthenticationFailed { command: &'static str, sw: StatusWord },

    /// `91AD` — caller must pause before retrying.
    #[error("authentication rate limited ({command}, sw={sw:04X})")]
    AuthenticationRateLimited { command: &'static str, sw: StatusWord },

    /// `911E` — CMAC or padding invalid. Always a code bug in this
    /// subsystem, never bad user input.
    #[error("integrity error ({command}, sw={sw:04X}): {detail}")]
    IntegrityError {
        command: &'static str,
        sw: StatusWord,
        detail: &'static str,
    },

    /// `917E` — APDU size exceeds tag limits.
    #[error("length error ({command}, sw={sw:04X})")]
    LengthError { command: &'static str, sw: StatusWord },

    /// `919D` — access right disallows the command.
    #[error("permission denied ({command}, sw={sw:04X})")]
    PermissionDenied { command: &'static str, sw: StatusWord },

    /// `91F0` — file or key index does not exist.
    #[error("not found ({command}, sw={sw:04X})")]
    NotFound { command: &'static str, sw: StatusWord },

    /// Reader-level or timeout failure.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Unexpected status word, malformed response, or continuation-frame
    /// violation.
    #[error("protocol error ({command}, sw={sw:04X}): {detail}")]
    ProtocolError {
        command: &'static str,
        sw: StatusWord,
        detail: String,
    },

    /// Key-store read/write failure or schema violation.
    #[error("store error: {0}")]
    StoreError(String),

    /// Attempted transition that violates the state-machine contract,
    /// e.g. re-provisioning an inconsistent tag without an explicit reset.
    #[error("state error: {0}")]
    StateError(String),

    /// This crate implements a closed set of commands; anything else is
    /// refused rather than silently forwarded.
    #[error("command not implemented: {0}")]
    NotImplemented(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a raw status word plus the command that produced it onto the
    /// error taxonomy. `command` is the stable command name used in
    /// diagnostics.
    pub fn from_status_word(command: &'static str, sw: StatusWord) -> Self {
        match sw {
            0x91AE => Error::AuthenticationFailed { command, sw },
            0x91AD => Error::AuthenticationRateLimited { command, sw },
            0x911E => Error::IntegrityError {
                command,
                sw,
                detail: "CMAC or padding mismatch",
            },
            0x917E => Error::LengthError { command, sw },
            0x919D | 0x919E => Error::PermissionDenied { command, sw },
            0x91F0 => Error::NotFound { command, sw },
            _ => Error::ProtocolError {
                command,
                sw,
                detail: format!("unexpected status word {sw:04X}"),
            },
        }
    }
}
