use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, RemoteError};

/// Message sent from the farm to a worker unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChildMessage {
    /// Load and prepare the target module. Sent once per (re)start.
    Initialize {
        module_path: String,
        setup_args: Vec<Value>,
    },

    /// Execute one exported function and report the outcome.
    Call {
        method: String,
        args: Vec<Value>,
        /// The caller expects a lazy sequence, drained into an array.
        lazy_sequence: bool,
    },

    /// Graceful shutdown request.
    End,
}

/// Message sent from a worker unit back to the farm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParentMessage {
    /// The current call completed successfully.
    Ok { result: Value },

    /// The invoked function failed.
    ClientError(RemoteError),

    /// `INITIALIZE` failed; the unit is unusable until respawned.
    SetupError(RemoteError),

    /// Out-of-band payload for the current call's custom message handler.
    CustomMessage { payload: Value },
}

impl ChildMessage {
    pub fn call(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Call {
            method: method.into(),
            args,
            lazy_sequence: false,
        }
    }

    /// Short tag used in logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "INITIALIZE",
            Self::Call { .. } => "CALL",
            Self::End => "END",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl ParentMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Ok { .. } => "OK",
            Self::ClientError(_) => "CLIENT_ERROR",
            Self::SetupError(_) => "SETUP_ERROR",
            Self::CustomMessage { .. } => "CUSTOM_MESSAGE",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Size of `value` once encoded as a frame payload, without building it.
pub fn encoded_len<T: Serialize + ?Sized>(value: &T) -> Result<usize, ProtocolError> {
    let mut counter = ByteCounter(0);
    rmp_serde::encode::write_named(&mut counter, value)?;
    Ok(counter.0)
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
