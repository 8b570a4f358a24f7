//! Calls as the farm tracks them, and the handles callers await.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;
use workfarm_protocol::{encoded_len, frame, ChildMessage, ProtocolError, WorkerId};

use crate::error::CallError;

pub type CallResult = Result<Value, CallError>;

/// Invoked once with the id of the worker a call is handed to.
pub type StartHook = Box<dyn FnOnce(WorkerId) + Send>;

/// Receives every custom message the worker sends during a call.
pub type CustomMessageHandler = Box<dyn FnMut(Value) + Send>;

/// Per-call options for [`crate::Facade::call_with`].
#[derive(Default)]
pub struct CallOptions {
    route_key: Option<String>,
    on_start: Option<StartHook>,
    on_custom_message: Option<CustomMessageHandler>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin this call, and every later call with the same key, to the worker
    /// that serves the first of them.
    pub fn route_key(mut self, key: impl Into<String>) -> Self {
        self.route_key = Some(key.into());
        self
    }

    pub fn on_start(mut self, hook: impl FnOnce(WorkerId) + Send + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    pub fn on_custom_message(mut self, handler: impl FnMut(Value) + Send + 'static) -> Self {
        self.on_custom_message = Some(Box::new(handler));
        self
    }
}

/// A submitted call, owned by the farm from submission to resolution.
///
/// Dropping a call without resolving it resolves its handle with
/// [`CallError::FarmEnded`].
pub struct Call {
    pub id: Uuid,
    pub method: String,
    pub args: Vec<Value>,
    pub lazy_sequence: bool,
    pub route_key: Option<String>,
    on_start: Option<StartHook>,
    on_custom_message: Option<CustomMessageHandler>,
    reply: Option<oneshot::Sender<CallResult>>,
}

impl Call {
    pub fn new(
        method: impl Into<String>,
        args: Vec<Value>,
        lazy_sequence: bool,
        options: CallOptions,
    ) -> (Self, CallHandle) {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let call = Self {
            id,
            method: method.into(),
            args,
            lazy_sequence,
            route_key: options.route_key,
            on_start: options.on_start,
            on_custom_message: options.on_custom_message,
            reply: Some(tx),
        };
        (call, CallHandle { id, rx })
    }

    /// The CALL message for this call. Cloned so it can be retransmitted.
    pub fn message(&self) -> ChildMessage {
        ChildMessage::Call {
            method: self.method.clone(),
            args: self.args.clone(),
            lazy_sequence: self.lazy_sequence,
        }
    }

    /// Fail fast on a CALL that no worker could receive in one frame.
    pub fn check_frame_size(&self) -> Result<(), CallError> {
        self.frame_len()
            .and_then(frame::ensure_fits)
            .map_err(|e| CallError::Encode(e.to_string()))
    }

    /// Encoded size of [`Call::message`], measured without cloning the args.
    fn frame_len(&self) -> Result<usize, ProtocolError> {
        encoded_len(&CallFrame::Call {
            method: &self.method,
            args: &self.args,
            lazy_sequence: self.lazy_sequence,
        })
    }

    /// Fire the start hook. Later invocations are no-ops.
    pub fn start(&mut self, worker_id: WorkerId) {
        if let Some(hook) = self.on_start.take() {
            hook(worker_id);
        }
    }

    pub fn custom_message(&mut self, payload: Value) {
        if let Some(handler) = self.on_custom_message.as_mut() {
            handler(payload);
        }
    }

    pub fn resolve(mut self, result: CallResult) {
        if let Some(tx) = self.reply.take() {
            // The caller may have dropped its handle.
            let _ = tx.send(result);
        }
    }
}

/// Borrowed twin of `ChildMessage::Call`, encoding to the same bytes.
#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum CallFrame<'a> {
    Call {
        method: &'a str,
        args: &'a [Value],
        lazy_sequence: bool,
    },
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("args", &self.args.len())
            .field("route_key", &self.route_key)
            .finish()
    }
}

/// Future resolving to the outcome of one call.
#[derive(Debug)]
pub struct CallHandle {
    id: Uuid,
    rx: oneshot::Receiver<CallResult>,
}

impl CallHandle {
    /// A handle that is already resolved.
    pub fn ready(result: CallResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self {
            id: Uuid::new_v4(),
            rx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for CallHandle {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CallError::FarmEnded)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn resolve_reaches_handle() {
        let (call, handle) = Call::new("add", vec![json!(1)], false, CallOptions::new());
        assert_eq!(call.id, handle.id());
        call.resolve(Ok(json!(2)));
        assert_eq!(handle.await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn dropped_call_resolves_as_farm_ended() {
        let (call, handle) = Call::new("add", vec![], false, CallOptions::new());
        drop(call);
        assert_eq!(handle.await.unwrap_err(), CallError::FarmEnded);
    }

    #[test]
    fn start_hook_fires_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = CallOptions::new().on_start(move |id| sink.lock().unwrap().push(id));
        let (mut call, _handle) = Call::new("x", vec![], false, options);
        call.start(3);
        call.start(4);
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[test]
    fn frame_len_matches_the_encoded_message() {
        let args = vec![json!({"path": "src/lib.rs", "flags": [1, 2.5, null]}), json!("x")];
        let (call, _handle) = Call::new("transform", args, true, CallOptions::new());
        assert_eq!(
            call.frame_len().unwrap(),
            call.message().to_bytes().unwrap().len()
        );
        assert!(call.check_frame_size().is_ok());
    }

    #[test]
    fn call_over_the_frame_limit_is_rejected() {
        let huge = "x".repeat(frame::MAX_FRAME_LEN);
        let (call, _handle) = Call::new("echo", vec![json!(huge)], false, CallOptions::new());
        assert!(matches!(call.check_frame_size(), Err(CallError::Encode(_))));
    }

    #[test]
    fn message_carries_sequence_flag() {
        let (call, _handle) = Call::new("walk", vec![json!("/")], true, CallOptions::new());
        assert_eq!(
            call.message(),
            ChildMessage::Call {
                method: "walk".into(),
                args: vec![json!("/")],
                lazy_sequence: true,
            }
        );
    }
}
