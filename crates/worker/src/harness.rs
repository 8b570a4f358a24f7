use std::io::Write;

use serde_json::Value;
use tracing::{debug, info, warn};
use workfarm_protocol::{ChildMessage, ParentMessage, RemoteError, WorkerId};

use crate::context::{CallContext, MessageSink};
use crate::error::HarnessError;
use crate::module::WorkerModule;
use crate::registry::ModuleRegistry;

/// What the driving loop should do after a message was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Continue,
    /// END was processed; exit cleanly.
    End,
    /// INITIALIZE failed and SETUP_ERROR was sent; exit with a failure.
    SetupFailed(RemoteError),
}

/// I/O a harness writes to while handling one message.
pub struct HarnessIo<'a> {
    pub sink: &'a mut dyn MessageSink,
    pub stdout: &'a mut dyn Write,
    pub stderr: &'a mut dyn Write,
}

/// Protocol state machine of one worker unit.
///
/// Transport agnostic: the process entry point feeds it decoded frames,
/// the thread backend feeds it channel messages.
pub struct Harness {
    registry: ModuleRegistry,
    worker_id: WorkerId,
    module: Option<Box<dyn WorkerModule>>,
}

impl Harness {
    pub fn new(registry: ModuleRegistry, worker_id: WorkerId) -> Self {
        Self {
            registry,
            worker_id,
            module: None,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn is_initialized(&self) -> bool {
        self.module.is_some()
    }

    pub fn handle(
        &mut self,
        message: ChildMessage,
        io: &mut HarnessIo<'_>,
    ) -> Result<Flow, HarnessError> {
        match message {
            ChildMessage::Initialize {
                module_path,
                setup_args,
            } => self.initialize(&module_path, &setup_args, io),
            ChildMessage::Call {
                method,
                args,
                lazy_sequence,
            } => self.call(&method, args, lazy_sequence, io),
            ChildMessage::End => {
                self.end();
                Ok(Flow::End)
            }
        }
    }

    fn initialize(
        &mut self,
        module_path: &str,
        setup_args: &[Value],
        io: &mut HarnessIo<'_>,
    ) -> Result<Flow, HarnessError> {
        if let Some(mut previous) = self.module.take() {
            previous.teardown();
        }

        let Some(mut module) = self.registry.resolve(module_path) else {
            let err = RemoteError::module_not_found(module_path);
            warn!(worker_id = self.worker_id, module_path, "module not found");
            io.sink.emit(ParentMessage::SetupError(err.clone()))?;
            return Ok(Flow::SetupFailed(err));
        };

        if let Err(err) = module.setup(setup_args) {
            warn!(worker_id = self.worker_id, module_path, error = %err, "module setup failed");
            io.sink.emit(ParentMessage::SetupError(err.clone()))?;
            return Ok(Flow::SetupFailed(err));
        }

        info!(worker_id = self.worker_id, module_path, "module initialized");
        self.module = Some(module);
        Ok(Flow::Continue)
    }

    fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        lazy_sequence: bool,
        io: &mut HarnessIo<'_>,
    ) -> Result<Flow, HarnessError> {
        let Some(module) = self.module.as_mut() else {
            io.sink.emit(ParentMessage::ClientError(RemoteError::new(
                "NotInitialized",
                format!("cannot call '{method}' before the module is initialized"),
            )))?;
            return Ok(Flow::Continue);
        };

        debug!(worker_id = self.worker_id, method, "executing call");
        let outcome = {
            let mut ctx = CallContext::new(
                self.worker_id,
                &mut *io.sink,
                &mut *io.stdout,
                &mut *io.stderr,
            );
            module.call(method, args, &mut ctx)
        };

        // Output written during the call must reach the farm before the reply.
        let _ = io.stdout.flush();
        let _ = io.stderr.flush();

        let reply = match outcome.and_then(|out| out.into_result(lazy_sequence)) {
            Ok(result) => ParentMessage::Ok { result },
            Err(err) => ParentMessage::ClientError(err),
        };
        io.sink.emit(reply)?;
        Ok(Flow::Continue)
    }

    fn end(&mut self) {
        if let Some(mut module) = self.module.take() {
            module.teardown();
        }
        debug!(worker_id = self.worker_id, "harness ended");
    }
}
