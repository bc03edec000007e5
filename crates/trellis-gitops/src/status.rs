//! Reconciliation status as reported by a GitOps controller

use std::fmt;

/// Whether the live state matches the desired state in git
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Not reported yet
    #[default]
    Unknown,
    /// Live state differs from desired state
    OutOfSync,
    /// Live state matches desired state
    Synced,
}

impl SyncState {
    /// Parse a controller-reported value; anything unrecognized is `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "Synced" => Self::Synced,
            "OutOfSync" => Self::OutOfSync,
            _ => Self::Unknown,
        }
    }
}

/// Aggregated health of the deployed resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthState {
    /// Not reported yet
    #[default]
    Unknown,
    /// Rolling out
    Progressing,
    /// Running as desired
    Healthy,
    /// Failed or failing
    Degraded,
    /// Resources absent from the cluster
    Missing,
}

impl HealthState {
    /// Parse a controller-reported value; anything unrecognized is `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "Healthy" => Self::Healthy,
            "Progressing" => Self::Progressing,
            "Degraded" => Self::Degraded,
            "Missing" => Self::Missing,
            _ => Self::Unknown,
        }
    }
}

/// Sync and health of one deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconciliationStatus {
    /// Sync state
    pub sync: SyncState,
    /// Health state
    pub health: HealthState,
}

impl ReconciliationStatus {
    /// Build from parts
    pub fn new(sync: SyncState, health: HealthState) -> Self {
        Self { sync, health }
    }

    /// Complete only when Synced and Healthy; no other combination counts
    pub fn is_converged(&self) -> bool {
        self.sync == SyncState::Synced && self.health == HealthState::Healthy
    }
}

impl fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync={:?} health={:?}", self.sync, self.health)
    }
}
