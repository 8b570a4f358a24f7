//! Public entry point: build a farm and call into it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;
use workfarm_protocol::WorkerId;
use workfarm_worker::ModuleRegistry;

use crate::backend::{InProcessWorker, ProcessBackend, ThreadBackend, WorkerBackend};
use crate::call::{Call, CallHandle, CallOptions};
use crate::config::{BackendKind, FarmConfig, ForkOptions, Scheduling};
use crate::dispatcher::{Dispatcher, DispatcherSettings, EndOutcome, FarmEvent};
use crate::error::{CallError, FarmError};
use crate::output::{OutputHub, OutputReceiver, OutputStream};
use crate::worker::WorkerInfo;

/// Handle to a running farm. Cheap to clone.
///
/// When the last clone is dropped without `end()`, every worker is killed.
#[derive(Clone)]
pub struct Facade {
    inner: Arc<FacadeInner>,
}

struct FacadeInner {
    farm_id: Uuid,
    methods: Vec<String>,
    sequence_methods: HashSet<String>,
    num_workers: usize,
    force_exit_timeout: Duration,
    /// Calls cross a process boundary and must fit in one frame.
    framed: bool,
    output: OutputHub,
    dispatch: Dispatch,
}

enum Dispatch {
    Pool(mpsc::UnboundedSender<FarmEvent>),
    InProcess(Mutex<InProcessWorker>),
}

impl Facade {
    pub fn farm_id(&self) -> Uuid {
        self.inner.farm_id
    }

    /// Exported method names, in declaration order.
    pub fn methods(&self) -> &[String] {
        &self.inner.methods
    }

    pub fn method(&self, name: &str) -> Option<MethodHandle> {
        self.inner.methods.iter().any(|m| m == name).then(|| MethodHandle {
            facade: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.inner.num_workers
    }

    pub fn call(&self, method: &str, args: Vec<Value>) -> CallHandle {
        self.call_with(method, args, CallOptions::default())
    }

    /// Submit a call. Never blocks; the handle resolves exactly once.
    pub fn call_with(&self, method: &str, args: Vec<Value>, options: CallOptions) -> CallHandle {
        if !self.inner.methods.iter().any(|m| m == method) {
            return CallHandle::ready(Err(CallError::UnknownMethod(method.to_string())));
        }
        let lazy_sequence = self.inner.sequence_methods.contains(method);
        let (call, handle) = Call::new(method, args, lazy_sequence, options);

        match &self.inner.dispatch {
            // A failed send drops the call, which resolves it as FarmEnded.
            Dispatch::Pool(tx) => {
                if let Err(e) = self.check_frame(&call) {
                    warn!(method, error = %e, "call does not fit in one frame");
                    call.resolve(Err(e));
                    return handle;
                }
                let _ = tx.send(FarmEvent::Submit(call));
            }
            Dispatch::InProcess(worker) => {
                worker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .run(call);
            }
        }
        handle
    }

    fn check_frame(&self, call: &Call) -> Result<(), CallError> {
        if self.inner.framed {
            call.check_frame_size()
        } else {
            Ok(())
        }
    }

    /// Merged stdout of all workers, from now on.
    pub fn stdout(&self) -> OutputReceiver {
        self.inner.output.subscribe(OutputStream::Stdout)
    }

    pub fn stderr(&self) -> OutputReceiver {
        self.inner.output.subscribe(OutputStream::Stderr)
    }

    pub fn worker_stdout(&self, worker_id: WorkerId) -> OutputReceiver {
        self.inner
            .output
            .subscribe_worker(OutputStream::Stdout, worker_id)
    }

    pub fn worker_stderr(&self, worker_id: WorkerId) -> OutputReceiver {
        self.inner
            .output
            .subscribe_worker(OutputStream::Stderr, worker_id)
    }

    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, FarmError> {
        match &self.inner.dispatch {
            Dispatch::Pool(tx) => {
                let (reply, rx) = oneshot::channel();
                tx.send(FarmEvent::Snapshot(reply))
                    .map_err(|_| FarmError::DispatcherGone)?;
                rx.await.map_err(|_| FarmError::DispatcherGone)
            }
            Dispatch::InProcess(worker) => Ok(vec![worker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .info()]),
        }
    }

    /// Send END to every worker and wait for them to exit.
    ///
    /// Workers still running after `timeout` (default: the configured
    /// force-exit timeout) are terminated and their calls fail with
    /// [`CallError::ShutdownForced`].
    pub async fn end(&self, timeout: Option<Duration>) -> Result<EndOutcome, FarmError> {
        let timeout = timeout.unwrap_or(self.inner.force_exit_timeout);
        match &self.inner.dispatch {
            Dispatch::Pool(tx) => {
                let (reply, rx) = oneshot::channel();
                tx.send(FarmEvent::End { timeout, reply })
                    .map_err(|_| FarmError::DispatcherGone)?;
                rx.await.map_err(|_| FarmError::DispatcherGone)?
            }
            Dispatch::InProcess(worker) => {
                worker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .end()?;
                Ok(EndOutcome {
                    force_exited: false,
                })
            }
        }
    }
}

impl std::fmt::Debug for Facade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Facade")
            .field("farm_id", &self.inner.farm_id)
            .field("methods", &self.inner.methods)
            .field("num_workers", &self.inner.num_workers)
            .finish()
    }
}

/// One exported method, bound to its farm.
#[derive(Debug, Clone)]
pub struct MethodHandle {
    facade: Facade,
    name: String,
}

impl MethodHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: Vec<Value>) -> CallHandle {
        self.facade.call(&self.name, args)
    }

    pub fn call_with(&self, args: Vec<Value>, options: CallOptions) -> CallHandle {
        self.facade.call_with(&self.name, args, options)
    }

    /// Typed call. A tuple or sequence spreads into positional arguments,
    /// `()` means no arguments, anything else is a single argument.
    pub async fn invoke<A, R>(&self, args: A) -> Result<R, CallError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = match serde_json::to_value(args).map_err(|e| CallError::Encode(e.to_string()))? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        let value = self.call(args).await?;
        serde_json::from_value(value).map_err(|e| CallError::Decode(e.to_string()))
    }
}

// ── Construction ─────────────────────────────────────────────────────

/// Fluent constructor for a [`Facade`].
#[derive(Debug, Clone)]
pub struct FarmBuilder {
    module_path: String,
    config: FarmConfig,
    registry: Option<ModuleRegistry>,
}

impl FarmBuilder {
    pub fn new(module_path: impl Into<String>) -> Self {
        Self {
            module_path: module_path.into(),
            config: FarmConfig::default(),
            registry: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: FarmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn exported_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.exported_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn sequence_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.sequence_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.num_workers = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn scheduling(mut self, scheduling: Scheduling) -> Self {
        self.config.scheduling = scheduling;
        self
    }

    pub fn force_exit_timeout(mut self, timeout: Duration) -> Self {
        self.config.force_exit_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.config.silent = silent;
        self
    }

    pub fn setup_args(mut self, args: Vec<Value>) -> Self {
        self.config.setup_args = args;
        self
    }

    pub fn fork_options(mut self, options: ForkOptions) -> Self {
        self.config.fork_options = options;
        self
    }

    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.config.fork_options.program = Some(program.into());
        self
    }

    /// Modules served by the thread and in-process backends.
    pub fn registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate the config and start every worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Facade, FarmError> {
        self.config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(FarmError::NoRuntime);
        }

        let Self {
            module_path,
            config,
            registry,
        } = self;
        let farm_id = Uuid::new_v4();
        let output = OutputHub::new(config.silent);
        let needs_registry = || {
            registry.clone().ok_or_else(|| {
                FarmError::Config(format!("the {} backend needs a module registry", config.backend))
            })
        };

        let (dispatch, num_workers) = match config.backend {
            BackendKind::InProcess => {
                let registry = needs_registry()?;
                let worker = InProcessWorker::new(
                    &registry,
                    &module_path,
                    &config.setup_args,
                    output.clone(),
                )?;
                (Dispatch::InProcess(Mutex::new(worker)), 1)
            }
            BackendKind::Thread | BackendKind::Process => {
                let backend: Box<dyn WorkerBackend> = match config.backend {
                    BackendKind::Thread => Box::new(ThreadBackend::new(needs_registry()?)),
                    _ => Box::new(ProcessBackend::new(
                        farm_id,
                        &module_path,
                        config.fork_options.clone(),
                    )?),
                };
                let settings = DispatcherSettings {
                    module_path: module_path.clone(),
                    setup_args: config.setup_args.clone(),
                    num_workers: config.num_workers,
                    max_retries: config.max_retries,
                    scheduling: config.scheduling,
                };
                let mut dispatcher = Dispatcher::new(settings, backend, output.clone());
                dispatcher.start();
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(dispatcher.run(rx));
                (Dispatch::Pool(tx), config.num_workers)
            }
        };

        info!(
            %farm_id,
            backend = %config.backend,
            workers = num_workers,
            module_path = %module_path,
            "farm created"
        );

        Ok(Facade {
            inner: Arc::new(FacadeInner {
                farm_id,
                methods: config.exported_methods.clone(),
                sequence_methods: config.sequence_methods.iter().cloned().collect(),
                num_workers,
                force_exit_timeout: config.force_exit_timeout(),
                framed: matches!(config.backend, BackendKind::Process),
                output,
                dispatch,
            }),
        })
    }
}

/// Build a farm for `module_path` from a complete config.
///
/// `registry` is required for the thread and in-process backends and
/// ignored by the process backend.
pub fn create_farm(
    module_path: impl Into<String>,
    config: FarmConfig,
    registry: Option<ModuleRegistry>,
) -> Result<Facade, FarmError> {
    let mut builder = FarmBuilder::new(module_path).config(config);
    if let Some(registry) = registry {
        builder = builder.registry(registry);
    }
    builder.build()
}
