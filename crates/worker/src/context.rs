use std::io::Write;

use serde::Serialize;
use workfarm_protocol::{ParentMessage, WorkerId};

use crate::error::HarnessError;

/// Destination for messages a harness sends back to its farm.
pub trait MessageSink {
    fn emit(&mut self, message: ParentMessage) -> Result<(), HarnessError>;
}

impl MessageSink for Vec<ParentMessage> {
    fn emit(&mut self, message: ParentMessage) -> Result<(), HarnessError> {
        self.push(message);
        Ok(())
    }
}

/// Handed to a worker function for the duration of one call.
pub struct CallContext<'a> {
    worker_id: WorkerId,
    sink: &'a mut dyn MessageSink,
    stdout: &'a mut dyn Write,
    stderr: &'a mut dyn Write,
}

impl<'a> CallContext<'a> {
    pub fn new(
        worker_id: WorkerId,
        sink: &'a mut dyn MessageSink,
        stdout: &'a mut dyn Write,
        stderr: &'a mut dyn Write,
    ) -> Self {
        Self {
            worker_id,
            sink,
            stdout,
            stderr,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Send an out-of-band payload to the caller's custom message handler.
    ///
    /// Does not resolve the call. Failures are logged; a broken channel
    /// surfaces again when the call's result is sent.
    pub fn send_custom_message<T: Serialize>(&mut self, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize custom message");
                return;
            }
        };
        if let Err(e) = self.sink.emit(ParentMessage::CustomMessage { payload }) {
            tracing::warn!(error = %e, "failed to send custom message");
        }
    }

    /// The unit's stdout, captured and tagged with the worker id by the farm.
    pub fn stdout(&mut self) -> &mut dyn Write {
        &mut *self.stdout
    }

    pub fn stderr(&mut self) -> &mut dyn Write {
        &mut *self.stderr
    }
}
