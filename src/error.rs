//! Error taxonomy surfaced to callers of the client.
//!
//! Identity and session failures carry the offending identifier so a caller can
//! offer a resolution (import the server key, create the nym, and so on).

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by the client core.
#[derive(Error, Debug)]
pub enum NymError {
    /// No server key with config/send/url uids exists for this domain.
    #[error("The nym server {0} was not found. Import its public key first")]
    NymservNotFound(String),

    /// The key provider has no key for this address.
    #[error("The nym {0} was not found")]
    NymNotFound(String),

    /// A key exists for the address but its fingerprint could not be resolved.
    #[error("The fingerprint of {0} could not be found")]
    FingerprintNotFound(String),

    /// A passphrase did not unlock the key or the ratchet store.
    #[error("Incorrect passphrase")]
    IncorrectPassphrase,

    /// The passphrase is empty.
    #[error("Invalid passphrase")]
    InvalidPassphrase,

    /// The address is not a valid email address.
    #[error("Invalid email address: {0}")]
    InvalidEmailAddress(String),

    /// The ephemeral key for a create/config request is empty.
    #[error("Invalid ephemeral key")]
    InvalidEphemeralKey,

    /// The hSub passphrase for a create request is empty.
    #[error("Invalid hSub passphrase")]
    InvalidHsub,

    /// An inbound message could not be decrypted with the ratchet state.
    #[error("Undecipherable message: {0}")]
    UndecipherableMessage(String),

    /// No ratchet state is stored for this conversation.
    #[error("No ratchet state for {0}")]
    StateNotFound(String),

    /// The ratchet store could not be opened or written.
    #[error("Ratchet store unavailable: {}", .0.display())]
    StoreUnavailable(PathBuf),

    /// An operation that needs an active session was called without one.
    #[error("No active session")]
    InactiveSession,

    /// The transport reported a failure.
    #[error("The message could not be sent to {0}")]
    SendFailed(String),

    /// The key provider failed outside an encrypt or decrypt call.
    #[error("Key provider failure: {0}")]
    Provider(String),

    /// Filesystem error outside the ratchet store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed or written.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for NymError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for NymError {
    fn from(e: toml::ser::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl NymError {
    pub(crate) fn provider(e: anyhow::Error) -> Self {
        Self::Provider(format!("{:#}", e))
    }
}

/// Result alias used across the crate.
pub type Result<T, E = NymError> = std::result::Result<T, E>;
