use std::path::PathBuf;
use thiserror::Error;

use crate::controller::ControllerState;
use crate::module::ModuleKind;
use crate::topology::Topology;

#[derive(Error, Debug)]
pub enum PanelError {
    #[error("{module} is required but not usable: {detail}")]
    MissingDependency { module: ModuleKind, detail: String },

    #[error("failed to write config {}: {source}", .path.display())]
    ConfigWriteFailure {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to launch {component}: {reason}")]
    ProcessLaunchFailure { component: ModuleKind, reason: String },

    #[error("failed to terminate {component}: {reason}")]
    ProcessTerminationFailure { component: ModuleKind, reason: String },

    #[error("cannot determine a version from install path {}", .path.display())]
    VersionParseFailure { path: PathBuf },

    #[error("startup failed at {failed}: {reason} (rolled back: {})", join_kinds(.started))]
    StartupFailed {
        started: Vec<ModuleKind>,
        failed: ModuleKind,
        reason: String,
    },

    #[error("another start/stop sequence is already in progress")]
    TransitionInProgress,

    #[error("cannot {action} while the stack is {state}")]
    InvalidState {
        action: &'static str,
        state: ControllerState,
    },

    #[error("{module} {version} is not installed")]
    VersionNotInstalled { module: ModuleKind, version: String },

    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("{server} is not part of the {topology} topology")]
    NotInTopology {
        server: ModuleKind,
        topology: Topology,
    },

    #[error("installation of {component} failed: {reason}")]
    InstallationFailed { component: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PanelError {
    /// Component the error is attributed to in the event log.
    pub fn component(&self) -> Option<ModuleKind> {
        match self {
            Self::MissingDependency { module, .. } | Self::VersionNotInstalled { module, .. } => {
                Some(*module)
            }
            Self::ProcessLaunchFailure { component, .. }
            | Self::ProcessTerminationFailure { component, .. } => Some(*component),
            Self::StartupFailed { failed, .. } => Some(*failed),
            Self::NotInTopology { server, .. } => Some(*server),
            _ => None,
        }
    }
}

fn join_kinds(kinds: &[ModuleKind]) -> String {
    if kinds.is_empty() {
        return "nothing".to_string();
    }
    kinds
        .iter()
        .map(ModuleKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, PanelError>;
