use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::manifest::ManifestError;
use crate::ports::PortError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStep {
    TransitionRules,
    RetireManifest,
    AwaitDrain,
}

impl fmt::Display for RolloutStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TransitionRules => "installing transition rules",
            Self::RetireManifest => "removing the retiring manifest",
            Self::AwaitDrain => "waiting for the retiring instance to drain",
        })
    }
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error(transparent)]
    Scan(#[from] ManifestError),

    #[error(transparent)]
    Ports(#[from] PortError),

    #[error("failed to ensure active rules for revision {revision}")]
    ActiveRules {
        revision: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("revision {revision} never became ready on port {port}")]
    NextNotReady {
        revision: u64,
        port: u16,
        #[source]
        source: anyhow::Error,
    },

    #[error("{step} failed, rules for revision {revision} were restored")]
    RolledBack {
        step: RolloutStep,
        revision: u64,
        #[source]
        source: anyhow::Error,
    },

    /// `source` is the step failure; `rollback` is the failed restore.
    #[error("{step} failed and restoring rules for revision {revision} also failed: {rollback:#}")]
    DoubleFault {
        step: RolloutStep,
        revision: u64,
        #[source]
        source: anyhow::Error,
        rollback: anyhow::Error,
    },

    #[error("failed to finalize rules for revision {revision}")]
    Finalize {
        revision: u64,
        #[source]
        source: anyhow::Error,
    },
}

impl RolloutError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scan(_) => "scan",
            Self::Ports(_) => "ports",
            Self::ActiveRules { .. } => "active_rules",
            Self::NextNotReady { .. } => "next_not_ready",
            Self::RolledBack { .. } => "rolled_back",
            Self::DoubleFault { .. } => "double_fault",
            Self::Finalize { .. } => "finalize",
        }
    }
}
