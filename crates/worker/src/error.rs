use thiserror::Error;
use workfarm_protocol::{ProtocolError, RemoteError};

/// Errors that stop a worker harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to connect to farm at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("module setup failed: {0}")]
    Setup(RemoteError),

    #[error("farm channel closed")]
    ChannelClosed,

    #[error("unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),
}

impl HarnessError {
    /// Process exit status reported for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Setup(_) => 1,
            Self::Protocol(_) => 2,
            Self::Connect { .. } | Self::UnsupportedEndpoint(_) => 3,
            Self::ChannelClosed => 4,
        }
    }
}
