use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::transport::Endpoint;
use crate::WorkerId;

/// Environment variable carrying the [`WorkerBootstrap`] of a worker process.
///
/// It is set on the child's command only; the farm never touches its own
/// environment.
pub const BOOTSTRAP_ENV: &str = "WORKFARM_BOOTSTRAP";

/// Per-worker configuration handed to a worker process at spawn time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    pub farm_id: Uuid,
    pub worker_id: WorkerId,
    /// Incremented on every respawn of the same worker slot.
    pub generation: u64,
    pub endpoint: Endpoint,
}

impl WorkerBootstrap {
    pub fn to_env_value(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Bootstrap(e.to_string()))
    }

    /// The `(name, value)` pair to set on a worker's command.
    pub fn to_env(&self) -> Result<(&'static str, String), ProtocolError> {
        Ok((BOOTSTRAP_ENV, self.to_env_value()?))
    }

    pub fn from_env_value(value: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(value).map_err(|e| ProtocolError::Bootstrap(e.to_string()))
    }

    /// Read the descriptor of the current process.
    pub fn from_env() -> Result<Self, ProtocolError> {
        let value = std::env::var(BOOTSTRAP_ENV).map_err(|_| {
            ProtocolError::Bootstrap(format!(
                "{BOOTSTRAP_ENV} is not set; worker executables must be started by a farm"
            ))
        })?;
        Self::from_env_value(&value)
    }
}
