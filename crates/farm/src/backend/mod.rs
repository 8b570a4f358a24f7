//! Execution units behind each worker.
//!
//! A [`WorkerBackend`] spawns one [`WorkerUnit`] per worker generation.
//! Units report back through [`UnitEvents`]; the dispatcher ignores events
//! from generations it has already replaced.

mod inprocess;
mod process;
mod thread;

pub use inprocess::InProcessWorker;
pub use process::ProcessBackend;
pub use thread::ThreadBackend;

use workfarm_protocol::{ChildMessage, WorkerId};

use crate::dispatcher::{EventSender, FarmEvent, UnitEvent};
use crate::error::FarmError;
use crate::output::OutputHub;

/// Tags unit events with the worker and generation that produced them.
#[derive(Debug, Clone)]
pub struct UnitEvents {
    worker_id: WorkerId,
    generation: u64,
    tx: EventSender,
}

impl UnitEvents {
    pub fn new(worker_id: WorkerId, generation: u64, tx: EventSender) -> Self {
        Self {
            worker_id,
            generation,
            tx,
        }
    }

    /// Returns false once the dispatcher is gone.
    pub fn send(&self, event: UnitEvent) -> bool {
        self.tx
            .send(FarmEvent::Unit {
                worker: self.worker_id,
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Per-spawn configuration handed to a backend.
pub struct SpawnContext {
    pub worker_id: WorkerId,
    pub generation: u64,
    pub events: UnitEvents,
    pub output: OutputHub,
}

pub trait WorkerBackend: Send {
    /// Start a unit. It must eventually report `Started` or `Exited`.
    fn spawn(&mut self, ctx: SpawnContext) -> Result<Box<dyn WorkerUnit>, FarmError>;

    /// Release farm-wide resources once every unit is gone.
    fn cleanup(&mut self) {}
}

/// A running execution unit. Dropping it terminates the unit.
pub trait WorkerUnit: Send {
    /// Queue a message. Delivery failures surface as an exit event.
    fn post(&mut self, message: ChildMessage);

    /// Terminate the unit. Returns true when an `Exited` event will follow.
    fn kill(&mut self) -> bool;

    fn pid(&self) -> Option<u32>;
}
