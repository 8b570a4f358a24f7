//! Parallel task-execution farm.
//!
//! A farm owns a fixed pool of isolated workers (child processes, OS threads
//! or a single in-process module), queues method calls, hands them to idle
//! workers and resolves each call exactly once, respawning workers that die
//! along the way.
//!
//! ```ignore
//! let farm = workfarm::FarmBuilder::new("target/debug/my-worker")
//!     .exported_methods(["transform"])
//!     .num_workers(4)
//!     .build()?;
//! let out = farm.call("transform", vec![json!("src/lib.rs")]).await?;
//! farm.end(None).await?;
//! ```

pub mod backend;
pub mod call;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod facade;
pub mod output;
pub mod queue;
pub mod worker;

pub use call::{Call, CallHandle, CallOptions};
pub use config::{BackendKind, FarmConfig, ForkOptions, Scheduling};
pub use dispatcher::{EndOutcome, FarmEvent, UnitEvent};
pub use error::{CallError, FarmError};
pub use facade::{create_farm, Facade, FarmBuilder, MethodHandle};
pub use output::{OutputChunk, OutputHub, OutputReceiver, OutputStream};
pub use worker::{WorkerInfo, WorkerState};

pub use workfarm_protocol::{RemoteError, WorkerId};
pub use workfarm_worker::{CallContext, CallOutput, FnModule, ModuleRegistry, WorkerModule};
