use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while encoding, decoding or moving protocol frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    /// Covers unknown message tags as well as corrupted payloads.
    #[error("unrecognized message: {0}")]
    UnknownMessage(#[from] rmp_serde::decode::Error),

    #[error("frame of {0} bytes exceeds the {max} byte limit", max = crate::frame::MAX_FRAME_LEN)]
    FrameTooLarge(usize),

    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bootstrap descriptor: {0}")]
    Bootstrap(String),
}

/// Structured error value carried across the worker boundary.
///
/// The farm rebuilds it by plain deserialization; `extra` holds whatever
/// custom fields the failing function attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    pub stack: Option<String>,
    pub extra: Map<String, Value>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
            extra: Map::new(),
        }
    }

    /// Generic failure raised by a worker function.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            "MethodNotFound",
            format!("method '{method}' is not exported by this module"),
        )
    }

    pub fn module_not_found(module_path: &str) -> Self {
        Self::new(
            "ModuleNotFound",
            format!("cannot find module '{module_path}'"),
        )
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Look up a custom field attached by the worker.
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}
