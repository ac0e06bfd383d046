use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::VmforkError;

/// Lifecycle status recorded in the registry. Deleted VMs have no row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmStatus {
    Running,
    Stopped,
}

impl VmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmStatus {
    type Err = VmforkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(VmStatus::Running),
            "stopped" => Ok(VmStatus::Stopped),
            other => Err(VmforkError::Registry {
                message: format!("unknown VM status '{other}'"),
            }),
        }
    }
}

/// A long-lived template VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    /// Pinned at creation; never re-resolved.
    pub provider: String,
    pub vm_handle: String,
    pub base_image_path: String,
    pub ip: Option<String>,
    pub status: VmStatus,
    pub created_at: DateTime<Utc>,
}

/// An ephemeral clone of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    /// Empty for legacy rows that predate project tracking.
    pub project: String,
    pub provider: String,
    pub vm_handle: String,
    /// Copied from the project at clone time.
    pub base_image_path: String,
    pub ip: Option<String>,
    pub status: VmStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for s in [VmStatus::Running, VmStatus::Stopped] {
            assert_eq!(s.to_string().parse::<VmStatus>().unwrap(), s);
        }
        assert!("paused".parse::<VmStatus>().is_err());
    }
}
