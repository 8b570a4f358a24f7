use thiserror::Error;
use workfarm_protocol::{RemoteError, WorkerId};

/// Errors raised while building, configuring or shutting down a farm.
#[derive(Debug, Error)]
pub enum FarmError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to spawn worker {worker_id}: {message}")]
    Spawn { worker_id: WorkerId, message: String },

    #[error("module setup failed: {0}")]
    Setup(RemoteError),

    #[error("farm must be created inside a Tokio runtime")]
    NoRuntime,

    #[error("farm has already been ended")]
    AlreadyEnded,

    #[error("farm dispatcher stopped")]
    DispatcherGone,
}

/// Terminal resolution of a single call that did not produce a value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The worker function failed. Never retried.
    #[error("{0}")]
    Client(RemoteError),

    /// The module failed to initialize on every allowed attempt.
    #[error("worker setup failed: {0}")]
    Setup(RemoteError),

    #[error("worker {worker_id} exited unexpectedly after {attempts} attempt(s)")]
    WorkerExited { worker_id: WorkerId, attempts: u32 },

    /// A worker sent something outside the protocol. The farm is faulted.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The call was in flight when `end()` ran out of time.
    #[error("call was still running when the farm was force-exited")]
    ShutdownForced,

    #[error("farm has been ended")]
    FarmEnded,

    #[error("no live workers remain")]
    NoLiveWorkers { last_error: Option<RemoteError> },

    #[error("method '{0}' is not exported by this farm")]
    UnknownMethod(String),

    #[error("failed to encode call arguments: {0}")]
    Encode(String),

    #[error("failed to decode call result: {0}")]
    Decode(String),
}

impl CallError {
    /// The structured error reported by the worker, if there is one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Client(e) | Self::Setup(e) => Some(e),
            Self::NoLiveWorkers { last_error } => last_error.as_ref(),
            _ => None,
        }
    }

    /// `kind` of the remote error, or a fixed name for farm-side failures.
    pub fn kind(&self) -> &str {
        match self {
            Self::Client(e) | Self::Setup(e) => &e.kind,
            Self::WorkerExited { .. } => "WorkerExitError",
            Self::Protocol(_) => "ProtocolError",
            Self::ShutdownForced => "ShutdownForcedError",
            Self::FarmEnded => "FarmEndedError",
            Self::NoLiveWorkers { .. } => "NoLiveWorkersError",
            Self::UnknownMethod(_) => "UnknownMethodError",
            Self::Encode(_) => "EncodeError",
            Self::Decode(_) => "DecodeError",
        }
    }
}
