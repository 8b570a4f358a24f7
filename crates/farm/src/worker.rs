//! Per-slot worker state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use workfarm_protocol::{ChildMessage, ParentMessage, RemoteError, WorkerId};

use crate::backend::{SpawnContext, UnitEvents, WorkerBackend, WorkerUnit};
use crate::call::{Call, CallResult};
use crate::dispatcher::{EventSender, UnitEvent};
use crate::error::CallError;
use crate::output::OutputHub;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Unit spawned, not yet connected.
    Starting,
    Idle,
    Busy,
    /// Ended, force-terminated or out of retries. Never leaves this state.
    Exited,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "STARTING",
            Self::Idle => "IDLE",
            Self::Busy => "BUSY",
            Self::Exited => "EXITED",
        })
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub retry_count: u32,
    pub calls_completed: u64,
    pub started_at: Option<DateTime<Utc>>,
}

/// Everything a worker needs from the farm to (re)start its unit.
pub struct WorkerEnv<'a> {
    pub backend: &'a mut dyn WorkerBackend,
    pub events: &'a EventSender,
    pub output: &'a OutputHub,
    pub module_path: &'a str,
    pub setup_args: &'a [Value],
    pub max_retries: u32,
    /// `end()` has started; units are not restarted any more.
    pub ending: bool,
}

/// One pool slot. Owns its unit exclusively.
pub struct Worker {
    id: WorkerId,
    state: WorkerState,
    unit: Option<Box<dyn WorkerUnit>>,
    current: Option<Call>,
    retry_count: u32,
    generation: u64,
    last_used: u64,
    calls_completed: u64,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    last_setup_error: Option<RemoteError>,
}

impl Worker {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            state: WorkerState::Starting,
            unit: None,
            current: None,
            retry_count: 0,
            generation: 0,
            last_used: 0,
            calls_completed: 0,
            pid: None,
            started_at: None,
            last_setup_error: None,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_used(&self) -> u64 {
        self.last_used
    }

    pub fn is_live(&self) -> bool {
        self.state != WorkerState::Exited
    }

    pub fn last_setup_error(&self) -> Option<&RemoteError> {
        self.last_setup_error.as_ref()
    }

    /// (Re)start the unit.
    ///
    /// A current call is retransmitted on the fresh unit until its attempts
    /// are spent; then it fails and the slot restarts with a fresh budget.
    /// A worker that runs out of attempts with nothing in flight is retired.
    pub fn initialize(&mut self, env: &mut WorkerEnv<'_>) {
        if let Some(mut old) = self.unit.take() {
            old.kill();
        }
        self.pid = None;

        if env.ending {
            debug!(worker_id = self.id, "farm is ending, not restarting worker");
            self.state = WorkerState::Exited;
            self.fail_current(CallError::WorkerExited {
                worker_id: self.id,
                attempts: self.retry_count,
            });
            return;
        }

        if self.retry_count >= env.max_retries {
            let Some(call) = self.current.take() else {
                warn!(
                    worker_id = self.id,
                    attempts = self.retry_count,
                    "worker keeps failing with no call in flight, retiring"
                );
                self.state = WorkerState::Exited;
                return;
            };
            warn!(
                worker_id = self.id,
                attempts = self.retry_count,
                call_id = %call.id,
                method = %call.method,
                "call exhausted its attempts"
            );
            let err = match self.last_setup_error.clone() {
                Some(setup) => CallError::Setup(setup),
                None => CallError::WorkerExited {
                    worker_id: self.id,
                    attempts: self.retry_count,
                },
            };
            call.resolve(Err(err));
            // The slot stays in service with a fresh budget.
            self.retry_count = 0;
        }

        self.retry_count += 1;
        self.generation += 1;
        self.state = if self.current.is_some() {
            WorkerState::Busy
        } else {
            WorkerState::Starting
        };

        let events = UnitEvents::new(self.id, self.generation, env.events.clone());
        let ctx = SpawnContext {
            worker_id: self.id,
            generation: self.generation,
            events: events.clone(),
            output: env.output.clone(),
        };
        match env.backend.spawn(ctx) {
            Ok(mut unit) => {
                unit.post(ChildMessage::Initialize {
                    module_path: env.module_path.to_string(),
                    setup_args: env.setup_args.to_vec(),
                });
                if let Some(call) = &self.current {
                    debug!(worker_id = self.id, call_id = %call.id, "retransmitting call");
                    unit.post(call.message());
                }
                self.pid = unit.pid();
                self.started_at = Some(Utc::now());
                self.unit = Some(unit);
                debug!(
                    worker_id = self.id,
                    generation = self.generation,
                    attempt = self.retry_count,
                    "worker unit started"
                );
            }
            Err(e) => {
                warn!(worker_id = self.id, error = %e, "failed to spawn worker unit");
                self.last_setup_error = Some(RemoteError::new("SpawnError", e.to_string()));
                // Handled like a unit that died right away.
                events.send(UnitEvent::Exited { code: None });
            }
        }
    }

    pub fn on_started(&mut self, pid: Option<u32>) {
        if pid.is_some() {
            self.pid = pid;
        }
        if self.state == WorkerState::Starting {
            self.state = WorkerState::Idle;
        }
    }

    /// Hand a call to an idle worker.
    pub fn send(&mut self, mut call: Call, tick: u64) {
        debug_assert_eq!(self.state, WorkerState::Idle);
        self.state = WorkerState::Busy;
        self.last_used = tick;
        call.start(self.id);
        self.retry_count = 1;
        debug!(worker_id = self.id, call_id = %call.id, method = %call.method, "dispatching call");
        if let Some(unit) = self.unit.as_mut() {
            unit.post(call.message());
        }
        self.current = Some(call);
    }

    /// Route one parent message. `Err` is a protocol violation.
    pub fn on_message(
        &mut self,
        message: ParentMessage,
        env: &mut WorkerEnv<'_>,
    ) -> Result<(), String> {
        match message {
            ParentMessage::Ok { result } => {
                self.last_setup_error = None;
                self.complete(Ok(result), "OK")
            }
            ParentMessage::ClientError(err) => self.complete(Err(CallError::Client(err)), "CLIENT_ERROR"),
            ParentMessage::SetupError(err) => {
                warn!(worker_id = self.id, error = %err, "worker setup failed");
                self.last_setup_error = Some(err);
                self.initialize(env);
                Ok(())
            }
            ParentMessage::CustomMessage { payload } => {
                match self.current.as_mut() {
                    Some(call) => call.custom_message(payload),
                    None => debug!(
                        worker_id = self.id,
                        %payload,
                        "dropping custom message with no call in flight"
                    ),
                }
                Ok(())
            }
        }
    }

    /// React to the unit going away.
    pub fn on_exit(&mut self, code: Option<i32>, env: &mut WorkerEnv<'_>) {
        if self.state == WorkerState::Exited {
            return;
        }
        self.unit = None;
        if env.ending {
            debug!(worker_id = self.id, ?code, "worker exited");
        } else {
            info!(worker_id = self.id, ?code, "worker exited unexpectedly, respawning");
        }
        self.initialize(env);
    }

    pub fn post_end(&mut self) {
        if let Some(unit) = self.unit.as_mut() {
            unit.post(ChildMessage::End);
        }
    }

    /// Terminate the unit. Returns true when an exit event will follow.
    pub fn kill(&mut self) -> bool {
        match self.unit.as_mut() {
            Some(unit) => unit.kill(),
            None => false,
        }
    }

    /// Give up on the worker without waiting for its unit.
    pub fn retire(&mut self) {
        self.unit = None;
        self.pid = None;
        self.state = WorkerState::Exited;
    }

    /// Fail the current call, if any, without touching the unit.
    pub fn fail_current(&mut self, err: CallError) {
        if let Some(call) = self.current.take() {
            call.resolve(Err(err));
        }
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            state: self.state,
            pid: self.pid,
            retry_count: self.retry_count,
            calls_completed: self.calls_completed,
            started_at: self.started_at,
        }
    }

    fn complete(&mut self, result: CallResult, tag: &str) -> Result<(), String> {
        let Some(call) = self.current.take() else {
            return Err(format!("worker {} sent {tag} with no call in flight", self.id));
        };
        debug!(worker_id = self.id, call_id = %call.id, tag, "call finished");
        call.resolve(result);
        self.calls_completed += 1;
        if self.state == WorkerState::Busy {
            self.state = WorkerState::Idle;
        }
        Ok(())
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("retry_count", &self.retry_count)
            .field("current", &self.current)
            .finish()
    }
}
