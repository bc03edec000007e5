//! Error types for credential, PKI and vault operations

use thiserror::Error;

/// Errors from the secrets stages
#[derive(Debug, Error)]
pub enum Error {
    /// Cluster, poll or configuration failure
    #[error(transparent)]
    Common(#[from] trellis_common::Error),

    /// Local credential store failure
    #[error("credential store error [{identity}]: {message}")]
    Store {
        /// Credential identity
        identity: String,
        /// Description of what failed
        message: String,
    },

    /// Certificate or key generation failed
    #[error("certificate generation failed: {0}")]
    Pki(String),

    /// Vault command failed or returned unexpected output
    #[error("vault error: {0}")]
    Vault(String),

    /// Local credential material contradicts cluster state
    #[error("credential mismatch [{identity}]: {message}")]
    Mismatch {
        /// Credential identity
        identity: String,
        /// What contradicts what
        message: String,
    },
}

impl Error {
    /// Create a store error
    pub fn store(identity: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            identity: identity.into(),
            message: msg.into(),
        }
    }

    /// Create a mismatch error
    pub fn mismatch(identity: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Mismatch {
            identity: identity.into(),
            message: msg.into(),
        }
    }

    /// Whether this wraps a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Common(e) if e.is_timeout())
    }
}

/// Result type for secrets operations
pub type Result<T> = std::result::Result<T, Error>;
