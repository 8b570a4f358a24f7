use std::collections::HashMap;

use serde_json::Value;
use workfarm_protocol::RemoteError;

use crate::context::CallContext;

/// What a worker function produced.
pub enum CallOutput {
    Value(Value),
    /// A lazily produced sequence. It is drained into an array only when
    /// the CALL asked for a lazy sequence.
    Sequence(Box<dyn Iterator<Item = Result<Value, RemoteError>> + Send>),
}

impl CallOutput {
    pub fn sequence<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::Sequence(Box::new(items.into_iter().map(Ok)))
    }

    /// Turn the output into the value reported back to the farm.
    pub fn into_result(self, lazy_sequence: bool) -> Result<Value, RemoteError> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Sequence(items) if lazy_sequence => {
                items.collect::<Result<Vec<_>, _>>().map(Value::Array)
            }
            Self::Sequence(_) => Err(RemoteError::type_error(
                "function returned a lazy sequence but the call did not request one",
            )),
        }
    }
}

impl From<Value> for CallOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl std::fmt::Debug for CallOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Sequence(_) => f.write_str("Sequence(..)"),
        }
    }
}

/// A module loaded once per worker unit and called repeatedly.
///
/// State kept in `self` is private to the unit that loaded it.
pub trait WorkerModule: Send {
    /// Runs on every (re)initialization with the farm's setup args.
    fn setup(&mut self, _args: &[Value]) -> Result<(), RemoteError> {
        Ok(())
    }

    fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        ctx: &mut CallContext<'_>,
    ) -> Result<CallOutput, RemoteError>;

    /// Runs on a graceful END.
    fn teardown(&mut self) {}
}

type MethodFn =
    Box<dyn FnMut(Vec<Value>, &mut CallContext<'_>) -> Result<CallOutput, RemoteError> + Send>;
type SetupFn = Box<dyn FnMut(&[Value]) -> Result<(), RemoteError> + Send>;

/// A [`WorkerModule`] assembled from closures, one per exported name.
#[derive(Default)]
pub struct FnModule {
    methods: HashMap<String, MethodFn>,
    setup: Option<SetupFn>,
}

impl FnModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export<F, R>(mut self, name: impl Into<String>, mut f: F) -> Self
    where
        F: FnMut(Vec<Value>, &mut CallContext<'_>) -> Result<R, RemoteError> + Send + 'static,
        R: Into<CallOutput>,
    {
        let method: MethodFn = Box::new(move |args: Vec<Value>, ctx: &mut CallContext<'_>| {
            f(args, ctx).map(Into::into)
        });
        self.methods.insert(name.into(), method);
        self
    }

    pub fn on_setup<F>(mut self, f: F) -> Self
    where
        F: FnMut(&[Value]) -> Result<(), RemoteError> + Send + 'static,
    {
        self.setup = Some(Box::new(f));
        self
    }

    pub fn exports(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl WorkerModule for FnModule {
    fn setup(&mut self, args: &[Value]) -> Result<(), RemoteError> {
        match self.setup.as_mut() {
            Some(setup) => setup(args),
            None => Ok(()),
        }
    }

    fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        ctx: &mut CallContext<'_>,
    ) -> Result<CallOutput, RemoteError> {
        match self.methods.get_mut(method) {
            Some(f) => f(args, ctx),
            None => Err(RemoteError::method_not_found(method)),
        }
    }
}
