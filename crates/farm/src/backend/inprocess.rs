//! A single module instance running in the caller's context.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use workfarm_protocol::{ParentMessage, RemoteError};
use workfarm_worker::{CallContext, HarnessError, MessageSink, ModuleRegistry, WorkerModule};

use crate::call::Call;
use crate::error::{CallError, FarmError};
use crate::output::{OutputHub, OutputStream};
use crate::worker::{WorkerInfo, WorkerState};

/// Runs calls synchronously, bypassing the protocol.
///
/// Behaves like a pool of one worker with id 0 that never crashes: a
/// panicking module unwinds into the caller.
pub struct InProcessWorker {
    module: Box<dyn WorkerModule>,
    output: OutputHub,
    state: WorkerState,
    calls_completed: u64,
    started_at: DateTime<Utc>,
}

impl InProcessWorker {
    pub fn new(
        registry: &ModuleRegistry,
        module_path: &str,
        setup_args: &[Value],
        output: OutputHub,
    ) -> Result<Self, FarmError> {
        let mut module = registry
            .resolve(module_path)
            .ok_or_else(|| FarmError::Setup(RemoteError::module_not_found(module_path)))?;
        module.setup(setup_args).map_err(FarmError::Setup)?;
        debug!(module_path, "in-process module initialized");

        Ok(Self {
            module,
            output,
            state: WorkerState::Idle,
            calls_completed: 0,
            started_at: Utc::now(),
        })
    }

    pub fn run(&mut self, mut call: Call) {
        if self.state == WorkerState::Exited {
            call.resolve(Err(CallError::FarmEnded));
            return;
        }

        call.start(0);
        let method = call.method.clone();
        let args = std::mem::take(&mut call.args);
        let lazy_sequence = call.lazy_sequence;

        self.state = WorkerState::Busy;
        let outcome = {
            let mut sink = CallSink(&mut call);
            let mut stdout = self.output.writer(0, OutputStream::Stdout);
            let mut stderr = self.output.writer(0, OutputStream::Stderr);
            let mut ctx = CallContext::new(0, &mut sink, &mut stdout, &mut stderr);
            self.module.call(&method, args, &mut ctx)
        };
        self.state = WorkerState::Idle;
        self.calls_completed += 1;

        let result = outcome
            .and_then(|out| out.into_result(lazy_sequence))
            .map_err(CallError::Client);
        call.resolve(result);
    }

    pub fn end(&mut self) -> Result<(), FarmError> {
        if self.state == WorkerState::Exited {
            return Err(FarmError::AlreadyEnded);
        }
        self.module.teardown();
        self.state = WorkerState::Exited;
        Ok(())
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: 0,
            state: self.state,
            pid: Some(std::process::id()),
            retry_count: 1,
            calls_completed: self.calls_completed,
            started_at: Some(self.started_at),
        }
    }
}

/// Forwards custom messages straight to the call's handler.
struct CallSink<'a>(&'a mut Call);

impl MessageSink for CallSink<'_> {
    fn emit(&mut self, message: ParentMessage) -> Result<(), HarnessError> {
        if let ParentMessage::CustomMessage { payload } = message {
            self.0.custom_message(payload);
        }
        Ok(())
    }
}
