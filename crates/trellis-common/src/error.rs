//! Error types shared by every trellis stage
//!
//! The variants follow how a bootstrap run reacts to a failure:
//! - `NotReady`: a resource is not visible yet; pollers keep polling
//! - `RetriableInfra`: network or API contention; retried with bounded backoff
//! - `Timeout`: a wait never succeeded; fatal to the run, carries the last
//!   observed state so operators can diagnose without re-querying the cluster
//! - `Fatal`: malformed input, auth failure, credential mismatch; never retried
//! - `GitConflict`: push rejected; resolved by one pull-rebase-retry

use std::time::Duration;

use thiserror::Error;

/// Main error type for trellis operations
#[derive(Debug, Error)]
pub enum Error {
    /// Resource not visible yet (created asynchronously by another controller)
    #[error("not ready [{resource}]: {message}")]
    NotReady {
        /// Resource being waited on
        resource: String,
        /// What was observed
        message: String,
    },

    /// A wait exceeded its budget
    #[error("timed out after {elapsed:?} waiting for {what}{}", format_observed(.last_observed))]
    Timeout {
        /// Human-readable description of the wait
        what: String,
        /// Last observed state (status snapshot or describe dump)
        last_observed: Option<String>,
        /// Time spent waiting
        elapsed: Duration,
    },

    /// A wait was aborted by its caller
    #[error("cancelled waiting for {what}")]
    Cancelled {
        /// Human-readable description of the wait
        what: String,
    },

    /// Network or API contention, safe to retry
    #[error("retriable infrastructure error [{context}]: {message}")]
    RetriableInfra {
        /// Operation that failed
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Non-recoverable failure
    #[error("fatal error [{context}]: {message}")]
    Fatal {
        /// Operation that failed
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Git push rejected by the remote
    #[error("git conflict: {message}")]
    GitConflict {
        /// Remote's rejection message
        message: String,
    },

    /// Configuration file or descriptor source is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_observed(observed: &Option<String>) -> String {
    match observed {
        Some(state) => format!("; last observed state:\n{}", state),
        None => String::new(),
    }
}

impl Error {
    /// Create a not-ready error
    pub fn not_ready(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotReady {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, last_observed: Option<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            last_observed,
            elapsed,
        }
    }

    /// Create a retriable infrastructure error
    pub fn retriable(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RetriableInfra {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a fatal error
    pub fn fatal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fatal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a git conflict error
    pub fn git_conflict(msg: impl Into<String>) -> Self {
        Self::GitConflict {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Whether a poller or retry loop may try again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady { .. } | Self::RetriableInfra { .. })
    }

    /// Whether this is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Classify a kube-rs error.
    ///
    /// Contention (409), throttling (429), server errors and transport failures
    /// are retriable. 404 and discovery failures are `NotReady`: during
    /// bootstrap they mean a CRD or namespace another controller has not
    /// created yet.
    /// Everything else (400, 403, 422, decode failures) is fatal.
    pub fn from_kube(context: impl Into<String>, err: kube::Error) -> Self {
        let context = context.into();
        match &err {
            kube::Error::Api(resp) => match resp.code {
                404 => Self::not_ready(context, resp.message.clone()),
                409 | 429 | 500..=599 => Self::retriable(context, err.to_string()),
                _ => Self::fatal(context, err.to_string()),
            },
            kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::HttpError(_) => {
                Self::retriable(context, err.to_string())
            }
            // Kind not served yet: its CRD is still being installed
            kube::Error::Discovery(_) => Self::not_ready(context, err.to_string()),
            _ => Self::fatal(context, err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
