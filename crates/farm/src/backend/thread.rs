//! OS-thread units running the harness over in-process channels.

use std::panic::{self, AssertUnwindSafe};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use workfarm_protocol::{ChildMessage, ParentMessage, WorkerId};
use workfarm_worker::{Flow, Harness, HarnessError, HarnessIo, MessageSink, ModuleRegistry};

use super::{SpawnContext, UnitEvents, WorkerBackend, WorkerUnit};
use crate::dispatcher::UnitEvent;
use crate::error::FarmError;
use crate::output::{OutputHub, OutputStream};

pub struct ThreadBackend {
    registry: ModuleRegistry,
}

impl ThreadBackend {
    pub fn new(registry: ModuleRegistry) -> Self {
        Self { registry }
    }
}

impl WorkerBackend for ThreadBackend {
    fn spawn(&mut self, ctx: SpawnContext) -> Result<Box<dyn WorkerUnit>, FarmError> {
        let SpawnContext {
            worker_id,
            events,
            output,
            ..
        } = ctx;
        let registry = self.registry.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name(format!("workfarm-worker-{worker_id}"))
            .spawn(move || run_unit(registry, worker_id, rx, events, output))
            .map_err(|e| FarmError::Spawn {
                worker_id,
                message: e.to_string(),
            })?;

        Ok(Box::new(ThreadUnit { messages: Some(tx) }))
    }
}

/// Threads cannot be killed. Killing closes the inbox and detaches the
/// thread; it exits after its current call, if it ever returns.
struct ThreadUnit {
    messages: Option<mpsc::UnboundedSender<ChildMessage>>,
}

impl WorkerUnit for ThreadUnit {
    fn post(&mut self, message: ChildMessage) {
        if let Some(tx) = &self.messages {
            let _ = tx.send(message);
        }
    }

    fn kill(&mut self) -> bool {
        self.messages = None;
        false
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

fn run_unit(
    registry: ModuleRegistry,
    worker_id: WorkerId,
    mut inbox: mpsc::UnboundedReceiver<ChildMessage>,
    events: UnitEvents,
    output: OutputHub,
) {
    events.send(UnitEvent::Started { pid: None });

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        serve(registry, worker_id, &mut inbox, &events, &output)
    }));
    let code = match outcome {
        Ok(Ok(())) => Some(0),
        Ok(Err(e)) => {
            debug!(worker_id, error = %e, "worker thread stopped");
            Some(i32::from(e.exit_code()))
        }
        Err(_) => {
            warn!(worker_id, "worker thread panicked");
            None
        }
    };
    events.send(UnitEvent::Exited { code });
}

fn serve(
    registry: ModuleRegistry,
    worker_id: WorkerId,
    inbox: &mut mpsc::UnboundedReceiver<ChildMessage>,
    events: &UnitEvents,
    output: &OutputHub,
) -> Result<(), HarnessError> {
    let mut harness = Harness::new(registry, worker_id);
    let mut sink = EventSink(events);
    let mut stdout = output.writer(worker_id, OutputStream::Stdout);
    let mut stderr = output.writer(worker_id, OutputStream::Stderr);

    while let Some(message) = inbox.blocking_recv() {
        let mut io = HarnessIo {
            sink: &mut sink,
            stdout: &mut stdout,
            stderr: &mut stderr,
        };
        match harness.handle(message, &mut io)? {
            Flow::Continue => {}
            Flow::End => return Ok(()),
            Flow::SetupFailed(err) => return Err(HarnessError::Setup(err)),
        }
    }
    Ok(())
}

struct EventSink<'a>(&'a UnitEvents);

impl MessageSink for EventSink<'_> {
    fn emit(&mut self, message: ParentMessage) -> Result<(), HarnessError> {
        if self.0.send(UnitEvent::Message(message)) {
            Ok(())
        } else {
            Err(HarnessError::ChannelClosed)
        }
    }
}
