//! Bootstrap harness that runs inside a worker unit.
//!
//! A worker executable registers its modules in a [`ModuleRegistry`] and
//! hands control to [`run_process`]. The farm's thread and in-process
//! backends drive the same [`Harness`] directly.
//!
//! ```ignore
//! use workfarm_worker::{run_process, FnModule, ModuleRegistry};
//!
//! fn main() -> std::process::ExitCode {
//!     let registry = ModuleRegistry::new().with_default(|| {
//!         FnModule::new().export("add", |args, _ctx| {
//!             let a = args[0].as_i64().unwrap_or(0);
//!             let b = args[1].as_i64().unwrap_or(0);
//!             Ok(serde_json::json!(a + b))
//!         })
//!     });
//!     workfarm_worker::exit_code(run_process(registry))
//! }
//! ```

pub mod context;
pub mod error;
pub mod harness;
pub mod module;
pub mod process;
pub mod registry;

pub use context::{CallContext, MessageSink};
pub use error::HarnessError;
pub use harness::{Flow, Harness, HarnessIo};
pub use module::{CallOutput, FnModule, WorkerModule};
pub use process::{exit_code, run_process};
pub use registry::{ModuleFactory, ModuleRegistry};

pub use workfarm_protocol::{RemoteError, WorkerId};
