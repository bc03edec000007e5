//! Common types for trellis: errors, polling, retries, the cluster API seam,
//! configuration and descriptor sources

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod kube_utils;
pub mod poll;
pub mod retry;

pub use cluster::{ApplyOutcome, ClusterApi, KubeClusterApi, ObjectRef, TypeRef};
pub use error::Error;
pub use poll::{wait_until, PollResult, WaitSpec};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "trellis";

/// Label put on every object trellis creates directly
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
