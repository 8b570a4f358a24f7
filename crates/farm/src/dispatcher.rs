//! The farm's control loop.
//!
//! A single task owns every worker and the queue. Facades talk to it with
//! commands; units report through a separate internal channel. All state
//! changes happen here, one event at a time.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};
use workfarm_protocol::{ParentMessage, RemoteError, WorkerId};

use crate::backend::WorkerBackend;
use crate::call::Call;
use crate::config::Scheduling;
use crate::error::{CallError, FarmError};
use crate::output::OutputHub;
use crate::queue::TaskQueue;
use crate::worker::{Worker, WorkerEnv, WorkerInfo, WorkerState};

pub type EventSender = mpsc::UnboundedSender<FarmEvent>;

/// Outcome of a completed `end()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EndOutcome {
    /// True when some worker had to be terminated after the timeout.
    pub force_exited: bool,
}

#[derive(Debug)]
pub enum FarmEvent {
    Submit(Call),
    Unit {
        worker: WorkerId,
        generation: u64,
        event: UnitEvent,
    },
    Snapshot(oneshot::Sender<Vec<WorkerInfo>>),
    End {
        timeout: Duration,
        reply: oneshot::Sender<Result<EndOutcome, FarmError>>,
    },
    /// The `end()` grace period ran out.
    EndDeadline,
}

/// What a unit reports about itself.
#[derive(Debug)]
pub enum UnitEvent {
    Started { pid: Option<u32> },
    Message(ParentMessage),
    ProtocolViolation(String),
    /// Sent exactly once per unit.
    Exited { code: Option<i32> },
}

/// Farm-wide settings the dispatcher needs.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub module_path: String,
    pub setup_args: Vec<Value>,
    pub num_workers: usize,
    pub max_retries: u32,
    pub scheduling: Scheduling,
}

enum Phase {
    Running,
    Ending {
        reply: oneshot::Sender<Result<EndOutcome, FarmError>>,
        forced: bool,
    },
    Ended,
    Faulted(String),
}

pub struct Dispatcher {
    settings: DispatcherSettings,
    workers: Vec<Worker>,
    queue: TaskQueue,
    backend: Box<dyn WorkerBackend>,
    output: OutputHub,
    events: EventSender,
    internal: mpsc::UnboundedReceiver<FarmEvent>,
    phase: Phase,
    end_requested: bool,
    tick: u64,
}

impl Dispatcher {
    pub fn new(settings: DispatcherSettings, backend: Box<dyn WorkerBackend>, output: OutputHub) -> Self {
        let (events, internal) = mpsc::unbounded_channel();
        let workers = (0..settings.num_workers)
            .map(|id| Worker::new(id as WorkerId))
            .collect();
        Self {
            settings,
            workers,
            queue: TaskQueue::new(),
            backend,
            output,
            events,
            internal,
            phase: Phase::Running,
            end_requested: false,
            tick: 0,
        }
    }

    /// Spawn the first unit of every worker.
    pub fn start(&mut self) {
        info!(
            workers = self.workers.len(),
            module_path = %self.settings.module_path,
            "starting farm"
        );
        for index in 0..self.workers.len() {
            self.with_worker(index, |worker, env| worker.initialize(env));
        }
    }

    /// Serve until every facade is gone.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<FarmEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                Some(event) = self.internal.recv() => event,
                command = commands.recv() => match command {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event);
        }
        self.abandon();
    }

    pub fn handle(&mut self, event: FarmEvent) {
        match event {
            FarmEvent::Submit(call) => self.submit(call),
            FarmEvent::Unit {
                worker,
                generation,
                event,
            } => self.on_unit_event(worker, generation, event),
            FarmEvent::Snapshot(reply) => {
                let _ = reply.send(self.workers.iter().map(Worker::info).collect());
            }
            FarmEvent::End { timeout, reply } => self.begin_end(timeout, reply),
            FarmEvent::EndDeadline => self.force_end(),
        }
    }

    fn submit(&mut self, call: Call) {
        match &self.phase {
            Phase::Running => {
                trace!(call_id = %call.id, method = %call.method, "call queued");
                self.queue.push(call);
                self.after_change();
            }
            Phase::Faulted(reason) => call.resolve(Err(CallError::Protocol(reason.clone()))),
            Phase::Ending { .. } | Phase::Ended => call.resolve(Err(CallError::FarmEnded)),
        }
    }

    fn on_unit_event(&mut self, worker: WorkerId, generation: u64, event: UnitEvent) {
        let Some(index) = self.workers.iter().position(|w| w.id() == worker) else {
            warn!(worker_id = worker, "event for unknown worker");
            return;
        };
        if self.workers[index].generation() != generation {
            trace!(worker_id = worker, generation, "ignoring event from a replaced unit");
            return;
        }
        if matches!(self.phase, Phase::Faulted(_) | Phase::Ended) {
            trace!(worker_id = worker, ?event, "ignoring unit event after shutdown");
            return;
        }

        match event {
            UnitEvent::Started { pid } => self.workers[index].on_started(pid),
            UnitEvent::Message(message) => {
                let outcome = self.with_worker(index, |w, env| w.on_message(message, env));
                if let Err(violation) = outcome {
                    self.fault(violation);
                    return;
                }
            }
            UnitEvent::ProtocolViolation(violation) => {
                self.fault(violation);
                return;
            }
            UnitEvent::Exited { code } => {
                self.with_worker(index, |w, env| w.on_exit(code, env));
            }
        }
        self.after_change();
    }

    /// Run after every state change: retire exhausted workers, dispatch,
    /// and complete a pending `end()`.
    fn after_change(&mut self) {
        match self.phase {
            Phase::Running => {
                for worker in self.workers.iter().filter(|w| !w.is_live()) {
                    self.queue.unpin_worker(worker.id());
                }
                if !self.workers.iter().any(Worker::is_live) {
                    self.fail_waiting();
                } else {
                    self.dispatch();
                }
            }
            Phase::Ending { .. } => self.finish_end_if_done(),
            Phase::Ended | Phase::Faulted(_) => {}
        }
    }

    fn dispatch(&mut self) {
        loop {
            let mut idle: Vec<usize> = (0..self.workers.len())
                .filter(|&i| self.workers[i].state() == WorkerState::Idle)
                .collect();
            if idle.is_empty() || self.queue.is_empty() {
                return;
            }
            if self.settings.scheduling == Scheduling::RoundRobin {
                idle.sort_by_key(|&i| (self.workers[i].last_used(), self.workers[i].id()));
            }

            let mut progressed = false;
            for index in idle {
                if let Some(call) = self.queue.next_for(self.workers[index].id()) {
                    self.tick += 1;
                    self.workers[index].send(call, self.tick);
                    progressed = true;
                    break;
                }
            }
            if !progressed {
                return;
            }
        }
    }

    fn fail_waiting(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let last_error: Option<RemoteError> = self
            .workers
            .iter()
            .filter_map(|w| w.last_setup_error().cloned())
            .last();
        warn!(waiting = self.queue.len(), "no live workers remain");
        for call in self.queue.drain() {
            call.resolve(Err(CallError::NoLiveWorkers {
                last_error: last_error.clone(),
            }));
        }
    }

    fn fault(&mut self, reason: String) {
        if matches!(self.phase, Phase::Faulted(_)) {
            return;
        }
        error!(%reason, "protocol violation, faulting farm");
        for call in self.queue.drain() {
            call.resolve(Err(CallError::Protocol(reason.clone())));
        }
        for worker in &mut self.workers {
            worker.fail_current(CallError::Protocol(reason.clone()));
            worker.kill();
            worker.retire();
        }
        self.backend.cleanup();
        if let Phase::Ending { reply, .. } =
            std::mem::replace(&mut self.phase, Phase::Faulted(reason.clone()))
        {
            let _ = reply.send(Ok(EndOutcome { force_exited: true }));
        }
    }

    fn begin_end(&mut self, timeout: Duration, reply: oneshot::Sender<Result<EndOutcome, FarmError>>) {
        if self.end_requested {
            let _ = reply.send(Err(FarmError::AlreadyEnded));
            return;
        }
        self.end_requested = true;

        if let Phase::Faulted(_) = self.phase {
            let _ = reply.send(Ok(EndOutcome { force_exited: true }));
            return;
        }

        info!(?timeout, "ending farm");
        for call in self.queue.drain() {
            call.resolve(Err(CallError::FarmEnded));
        }
        for worker in self.workers.iter_mut().filter(|w| w.is_live()) {
            worker.post_end();
        }
        self.phase = Phase::Ending {
            reply,
            forced: false,
        };

        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(FarmEvent::EndDeadline);
        });

        self.finish_end_if_done();
    }

    fn force_end(&mut self) {
        let Phase::Ending { forced, .. } = &mut self.phase else {
            return;
        };
        *forced = true;

        let remaining = self.workers.iter().filter(|w| w.is_live()).count();
        warn!(remaining, "end timeout elapsed, force-exiting workers");
        for worker in self.workers.iter_mut().filter(|w| w.is_live()) {
            worker.fail_current(CallError::ShutdownForced);
            if !worker.kill() {
                worker.retire();
            }
        }
        self.finish_end_if_done();
    }

    fn finish_end_if_done(&mut self) {
        if self.workers.iter().any(Worker::is_live) {
            return;
        }
        if let Phase::Ending { reply, forced } = std::mem::replace(&mut self.phase, Phase::Ended) {
            self.backend.cleanup();
            info!(force_exited = forced, "farm ended");
            let _ = reply.send(Ok(EndOutcome {
                force_exited: forced,
            }));
        }
    }

    /// Every facade was dropped: stop without waiting for anything.
    fn abandon(&mut self) {
        if !matches!(self.phase, Phase::Ended) {
            debug!("all handles dropped, terminating workers");
        }
        for call in self.queue.drain() {
            call.resolve(Err(CallError::FarmEnded));
        }
        for worker in &mut self.workers {
            worker.fail_current(CallError::FarmEnded);
            worker.kill();
            worker.retire();
        }
        self.backend.cleanup();
        self.phase = Phase::Ended;
    }

    fn with_worker<R>(&mut self, index: usize, f: impl FnOnce(&mut Worker, &mut WorkerEnv<'_>) -> R) -> R {
        let mut env = WorkerEnv {
            backend: self.backend.as_mut(),
            events: &self.events,
            output: &self.output,
            module_path: &self.settings.module_path,
            setup_args: &self.settings.setup_args,
            max_retries: self.settings.max_retries,
            ending: !matches!(self.phase, Phase::Running),
        };
        f(&mut self.workers[index], &mut env)
    }

    #[cfg(test)]
    fn pump(&mut self) {
        while let Ok(event) = self.internal.try_recv() {
            self.handle(event);
        }
    }
}

#[cfg(test)]
mod tests;
