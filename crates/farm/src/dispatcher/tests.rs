use std::sync::{Arc, Mutex};

use serde_json::json;
use workfarm_protocol::ChildMessage;

use super::*;
use crate::backend::{SpawnContext, WorkerUnit};
use crate::call::{CallHandle, CallOptions, CallResult};

// ── Scripted backend ─────────────────────────────────────────────────

#[derive(Default)]
struct Log {
    spawned: Vec<(WorkerId, u64)>,
    posted: Vec<(WorkerId, u64, ChildMessage)>,
    killed: Vec<(WorkerId, u64)>,
}

type SharedLog = Arc<Mutex<Log>>;

struct FakeBackend {
    log: SharedLog,
    killable: bool,
    fail_spawn: bool,
}

impl WorkerBackend for FakeBackend {
    fn spawn(&mut self, ctx: SpawnContext) -> Result<Box<dyn WorkerUnit>, FarmError> {
        if self.fail_spawn {
            return Err(FarmError::Spawn {
                worker_id: ctx.worker_id,
                message: "no such file".into(),
            });
        }
        self.log
            .lock()
            .unwrap()
            .spawned
            .push((ctx.worker_id, ctx.generation));
        Ok(Box::new(FakeUnit {
            worker: ctx.worker_id,
            generation: ctx.generation,
            log: self.log.clone(),
            killable: self.killable,
        }))
    }
}

struct FakeUnit {
    worker: WorkerId,
    generation: u64,
    log: SharedLog,
    killable: bool,
}

impl WorkerUnit for FakeUnit {
    fn post(&mut self, message: ChildMessage) {
        self.log
            .lock()
            .unwrap()
            .posted
            .push((self.worker, self.generation, message));
    }

    fn kill(&mut self) -> bool {
        self.log
            .lock()
            .unwrap()
            .killed
            .push((self.worker, self.generation));
        self.killable
    }

    fn pid(&self) -> Option<u32> {
        Some(1000 + self.worker)
    }
}

// ── Harness helpers ──────────────────────────────────────────────────

struct Farm {
    d: Dispatcher,
    log: SharedLog,
}

fn farm_with(workers: usize, max_retries: u32, scheduling: Scheduling, backend: FakeBackend) -> Farm {
    let log = backend.log.clone();
    let settings = DispatcherSettings {
        module_path: "fake-module".into(),
        setup_args: vec![json!("arg")],
        num_workers: workers,
        max_retries,
        scheduling,
    };
    let mut d = Dispatcher::new(settings, Box::new(backend), OutputHub::new(true));
    d.start();
    d.pump();
    Farm { d, log }
}

fn farm(workers: usize, max_retries: u32) -> Farm {
    let backend = FakeBackend {
        log: SharedLog::default(),
        killable: true,
        fail_spawn: false,
    };
    farm_with(workers, max_retries, Scheduling::RoundRobin, backend)
}

impl Farm {
    fn unit(&mut self, worker: WorkerId, generation: u64, event: UnitEvent) {
        self.d.handle(FarmEvent::Unit {
            worker,
            generation,
            event,
        });
        self.d.pump();
    }

    fn started(&mut self, worker: WorkerId, generation: u64) {
        self.unit(worker, generation, UnitEvent::Started { pid: None });
    }

    fn ok(&mut self, worker: WorkerId, generation: u64, result: Value) {
        self.unit(
            worker,
            generation,
            UnitEvent::Message(ParentMessage::Ok { result }),
        );
    }

    fn exited(&mut self, worker: WorkerId, generation: u64) {
        self.unit(worker, generation, UnitEvent::Exited { code: Some(1) });
    }

    fn submit(&mut self, method: &str) -> CallHandle {
        let (call, handle) = Call::new(method, vec![], false, CallOptions::new());
        self.d.handle(FarmEvent::Submit(call));
        handle
    }

    fn end(&mut self) -> oneshot::Receiver<Result<EndOutcome, FarmError>> {
        let (reply, rx) = oneshot::channel();
        self.d.handle(FarmEvent::End {
            timeout: Duration::from_secs(60),
            reply,
        });
        rx
    }

    /// CALL methods posted to `worker`, across generations.
    fn calls_for(&self, worker: WorkerId) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .posted
            .iter()
            .filter_map(|(w, _, m)| match m {
                ChildMessage::Call { method, .. } if *w == worker => Some(method.clone()),
                _ => None,
            })
            .collect()
    }

    fn posted_to(&self, worker: WorkerId, generation: u64) -> Vec<&'static str> {
        self.log
            .lock()
            .unwrap()
            .posted
            .iter()
            .filter(|(w, g, _)| *w == worker && *g == generation)
            .map(|(_, _, m)| m.tag())
            .collect()
    }

    fn states(&self) -> Vec<WorkerState> {
        self.d.workers.iter().map(Worker::state).collect()
    }
}

async fn outcome(handle: CallHandle) -> CallResult {
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("call was not resolved")
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn workers_are_initialized_with_setup_args() {
    let f = farm(2, 3);
    assert_eq!(f.log.lock().unwrap().spawned, vec![(0, 1), (1, 1)]);
    let log = f.log.lock().unwrap();
    assert_eq!(
        log.posted[0].2,
        ChildMessage::Initialize {
            module_path: "fake-module".into(),
            setup_args: vec![json!("arg")],
        }
    );
    drop(log);
    assert_eq!(f.states(), vec![WorkerState::Starting, WorkerState::Starting]);
}

#[tokio::test]
async fn calls_wait_for_started_workers_and_run_fifo() {
    let mut f = farm(2, 3);
    let a = f.submit("a");
    let b = f.submit("b");
    let c = f.submit("c");
    assert!(f.calls_for(0).is_empty());

    f.started(0, 1);
    f.started(1, 1);
    assert_eq!(f.calls_for(0), vec!["a"]);
    assert_eq!(f.calls_for(1), vec!["b"]);

    f.ok(0, 1, json!("A"));
    assert_eq!(f.calls_for(0), vec!["a", "c"]);
    assert_eq!(outcome(a).await.unwrap(), json!("A"));

    f.ok(1, 1, json!("B"));
    f.ok(0, 1, json!("C"));
    assert_eq!(outcome(b).await.unwrap(), json!("B"));
    assert_eq!(outcome(c).await.unwrap(), json!("C"));
    assert_eq!(f.states(), vec![WorkerState::Idle, WorkerState::Idle]);
}

#[tokio::test]
async fn round_robin_picks_least_recently_used_worker() {
    let mut f = farm(3, 3);
    for w in 0..3 {
        f.started(w, 1);
    }
    for (expected, method) in [(0, "x"), (1, "y"), (2, "z"), (0, "w")] {
        let handle = f.submit(method);
        assert_eq!(f.calls_for(expected).last().map(String::as_str), Some(method));
        f.ok(expected, 1, json!(null));
        outcome(handle).await.unwrap();
    }
}

#[tokio::test]
async fn in_order_picks_lowest_idle_worker() {
    let backend = FakeBackend {
        log: SharedLog::default(),
        killable: true,
        fail_spawn: false,
    };
    let mut f = farm_with(3, 3, Scheduling::InOrder, backend);
    for w in 0..3 {
        f.started(w, 1);
    }
    for method in ["x", "y", "z"] {
        let handle = f.submit(method);
        f.ok(0, 1, json!(null));
        outcome(handle).await.unwrap();
    }
    assert_eq!(f.calls_for(0), vec!["x", "y", "z"]);
    assert!(f.calls_for(1).is_empty());
}

#[tokio::test]
async fn crash_retransmits_current_call() {
    let mut f = farm(1, 3);
    f.started(0, 1);
    let a = f.submit("a");

    f.exited(0, 1);
    assert_eq!(f.posted_to(0, 2), vec!["INITIALIZE", "CALL"]);
    assert_eq!(f.states(), vec![WorkerState::Busy]);

    // A late reply from the dead unit is ignored.
    f.ok(0, 1, json!("stale"));
    f.started(0, 2);
    f.ok(0, 2, json!("fresh"));
    assert_eq!(outcome(a).await.unwrap(), json!("fresh"));
}

#[tokio::test]
async fn exhausted_call_fails_but_worker_stays_in_service() {
    let mut f = farm(1, 2);
    f.started(0, 1);
    let a = f.submit("a");
    let b = f.submit("b");

    f.exited(0, 1);
    f.exited(0, 2);

    assert_eq!(
        outcome(a).await.unwrap_err(),
        CallError::WorkerExited {
            worker_id: 0,
            attempts: 2
        }
    );
    // A fresh unit comes up without the failed call.
    assert_eq!(f.posted_to(0, 3), vec!["INITIALIZE"]);
    assert_eq!(f.states(), vec![WorkerState::Starting]);

    f.started(0, 3);
    assert_eq!(f.calls_for(0), vec!["a", "a", "b"]);
    f.ok(0, 3, json!("b done"));
    assert_eq!(outcome(b).await.unwrap(), json!("b done"));
    assert_eq!(f.states(), vec![WorkerState::Idle]);
}

#[tokio::test]
async fn repeated_crashing_calls_never_empty_the_pool() {
    let mut f = farm(2, 2);
    f.started(0, 1);
    f.started(1, 1);
    let a = f.submit("boom");
    let b = f.submit("boom");

    for worker in [0, 1] {
        f.exited(worker, 1);
        f.exited(worker, 2);
    }
    for handle in [a, b] {
        assert!(matches!(
            outcome(handle).await.unwrap_err(),
            CallError::WorkerExited { attempts: 2, .. }
        ));
    }

    f.started(0, 3);
    f.started(1, 3);
    let c = f.submit("ok");
    f.ok(0, 3, json!(true));
    assert_eq!(outcome(c).await.unwrap(), json!(true));
    assert!(f.states().iter().all(|s| *s == WorkerState::Idle));
}

#[tokio::test]
async fn setup_error_fails_call_once_budget_is_spent() {
    let mut f = farm(1, 2);
    f.started(0, 1);
    let a = f.submit("a");
    let err = RemoteError::new("SetupError", "bad config");

    f.unit(0, 1, UnitEvent::Message(ParentMessage::SetupError(err.clone())));
    assert_eq!(f.log.lock().unwrap().spawned.len(), 2);
    f.unit(0, 2, UnitEvent::Message(ParentMessage::SetupError(err.clone())));

    assert_eq!(outcome(a).await.unwrap_err(), CallError::Setup(err.clone()));
    assert_eq!(f.log.lock().unwrap().spawned.len(), 3);

    // With nothing in flight, a module that never sets up retires the worker.
    f.unit(0, 3, UnitEvent::Message(ParentMessage::SetupError(err.clone())));
    f.unit(0, 4, UnitEvent::Message(ParentMessage::SetupError(err.clone())));
    assert_eq!(f.states(), vec![WorkerState::Exited]);
    assert_eq!(f.log.lock().unwrap().spawned.len(), 4);

    let b = f.submit("b");
    assert_eq!(
        outcome(b).await.unwrap_err(),
        CallError::NoLiveWorkers {
            last_error: Some(err)
        }
    );
}

#[tokio::test]
async fn client_error_does_not_respawn() {
    let mut f = farm(1, 3);
    f.started(0, 1);
    let a = f.submit("a");
    let err = RemoteError::new("RangeError", "too big").with_extra("limit", 10);
    f.unit(0, 1, UnitEvent::Message(ParentMessage::ClientError(err.clone())));

    assert_eq!(outcome(a).await.unwrap_err(), CallError::Client(err));
    assert_eq!(f.log.lock().unwrap().spawned.len(), 1);
    assert_eq!(f.states(), vec![WorkerState::Idle]);
}

#[tokio::test]
async fn custom_messages_reach_the_current_call() {
    let mut f = farm(1, 3);
    f.started(0, 1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let options = CallOptions::new().on_custom_message(move |v| sink.lock().unwrap().push(v));
    let (call, handle) = Call::new("a", vec![], false, options);
    f.d.handle(FarmEvent::Submit(call));

    for step in 0..3 {
        f.unit(
            0,
            1,
            UnitEvent::Message(ParentMessage::CustomMessage {
                payload: json!({ "step": step }),
            }),
        );
    }
    f.ok(0, 1, json!(3));
    assert_eq!(outcome(handle).await.unwrap(), json!(3));
    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn stray_custom_message_is_dropped() {
    let mut f = farm(2, 3);
    f.started(0, 1);
    f.started(1, 1);
    let a = f.submit("a");

    f.unit(
        1,
        1,
        UnitEvent::Message(ParentMessage::CustomMessage {
            payload: json!("heartbeat"),
        }),
    );

    assert!(f.log.lock().unwrap().killed.is_empty());
    f.ok(0, 1, json!("still running"));
    assert_eq!(outcome(a).await.unwrap(), json!("still running"));
    let b = f.submit("b");
    f.ok(1, 1, json!(2));
    assert_eq!(outcome(b).await.unwrap(), json!(2));
}

#[tokio::test]
async fn protocol_violation_faults_the_farm() {
    let mut f = farm(2, 3);
    f.started(0, 1);
    f.started(1, 1);
    let a = f.submit("a");
    let b = f.submit("b");
    let c = f.submit("c");

    f.unit(0, 1, UnitEvent::ProtocolViolation("garbage".into()));

    for handle in [a, b, c] {
        assert_eq!(
            outcome(handle).await.unwrap_err(),
            CallError::Protocol("garbage".into())
        );
    }
    let d = f.submit("d");
    assert!(matches!(outcome(d).await.unwrap_err(), CallError::Protocol(_)));
    assert_eq!(f.log.lock().unwrap().killed.len(), 2);

    let end = f.end().await.unwrap().unwrap();
    assert!(end.force_exited);
}

#[tokio::test]
async fn unsolicited_reply_is_a_violation() {
    let mut f = farm(1, 3);
    f.started(0, 1);
    f.ok(0, 1, json!("nobody asked"));
    let a = f.submit("a");
    assert!(matches!(outcome(a).await.unwrap_err(), CallError::Protocol(_)));
}

#[tokio::test]
async fn graceful_end_waits_for_exits() {
    let mut f = farm(2, 3);
    f.started(0, 1);
    f.started(1, 1);
    let a = f.submit("a");

    let mut end = f.end();
    assert_eq!(f.posted_to(0, 1), vec!["INITIALIZE", "CALL", "END"]);
    assert_eq!(f.posted_to(1, 1), vec!["INITIALIZE", "END"]);

    f.ok(0, 1, json!("done"));
    assert_eq!(outcome(a).await.unwrap(), json!("done"));
    f.exited(1, 1);
    assert!(end.try_recv().is_err());
    f.exited(0, 1);

    let outcome_of_end = end.await.unwrap().unwrap();
    assert!(!outcome_of_end.force_exited);
    assert_eq!(f.states(), vec![WorkerState::Exited, WorkerState::Exited]);
    // Nothing was respawned.
    assert_eq!(f.log.lock().unwrap().spawned.len(), 2);

    let again = f.end().await.unwrap();
    assert!(matches!(again, Err(FarmError::AlreadyEnded)));
    let late = f.submit("late");
    assert_eq!(outcome(late).await.unwrap_err(), CallError::FarmEnded);
}

#[tokio::test]
async fn end_fails_queued_calls() {
    let mut f = farm(1, 3);
    f.started(0, 1);
    let a = f.submit("a");
    let b = f.submit("b");
    let _end = f.end();
    assert_eq!(outcome(b).await.unwrap_err(), CallError::FarmEnded);
    f.ok(0, 1, json!(1));
    assert_eq!(outcome(a).await.unwrap(), json!(1));
}

#[tokio::test]
async fn deadline_forces_exit_and_fails_in_flight_calls() {
    let mut f = farm(1, 3);
    f.started(0, 1);
    let a = f.submit("slow");
    let mut end = f.end();

    f.d.handle(FarmEvent::EndDeadline);
    assert_eq!(outcome(a).await.unwrap_err(), CallError::ShutdownForced);
    assert_eq!(f.log.lock().unwrap().killed, vec![(0, 1)]);
    assert!(end.try_recv().is_err());

    f.exited(0, 1);
    assert!(end.await.unwrap().unwrap().force_exited);
}

#[tokio::test]
async fn unkillable_units_are_detached_at_the_deadline() {
    let backend = FakeBackend {
        log: SharedLog::default(),
        killable: false,
        fail_spawn: false,
    };
    let mut f = farm_with(1, 3, Scheduling::RoundRobin, backend);
    f.started(0, 1);
    let a = f.submit("slow");
    let end = f.end();

    f.d.handle(FarmEvent::EndDeadline);
    assert_eq!(outcome(a).await.unwrap_err(), CallError::ShutdownForced);
    assert!(end.await.unwrap().unwrap().force_exited);
}

#[tokio::test]
async fn spawn_failures_exhaust_the_worker() {
    let backend = FakeBackend {
        log: SharedLog::default(),
        killable: true,
        fail_spawn: true,
    };
    let mut f = farm_with(1, 3, Scheduling::RoundRobin, backend);
    assert_eq!(f.states(), vec![WorkerState::Exited]);

    let a = f.submit("a");
    match outcome(a).await.unwrap_err() {
        CallError::NoLiveWorkers {
            last_error: Some(err),
        } => assert_eq!(err.kind, "SpawnError"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn snapshot_reports_every_worker() {
    let mut f = farm(2, 3);
    f.started(1, 1);
    let (tx, rx) = oneshot::channel();
    f.d.handle(FarmEvent::Snapshot(tx));
    let infos = rx.await.unwrap();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].state, WorkerState::Starting);
    assert_eq!(infos[1].state, WorkerState::Idle);
    assert_eq!(infos[1].pid, Some(1001));
    assert_eq!(infos[1].retry_count, 1);
}

#[tokio::test]
async fn route_key_pins_calls_to_one_worker() {
    let mut f = farm(2, 3);
    f.started(0, 1);
    f.started(1, 1);
    let mut handles = Vec::new();
    for method in ["k1", "k2"] {
        let (call, handle) = Call::new(method, vec![], false, CallOptions::new().route_key("file"));
        f.d.handle(FarmEvent::Submit(call));
        handles.push(handle);
    }
    // Worker 1 is idle but must not take k2.
    assert_eq!(f.calls_for(0), vec!["k1"]);
    assert!(f.calls_for(1).is_empty());

    f.ok(0, 1, json!(1));
    assert_eq!(f.calls_for(0), vec!["k1", "k2"]);
    f.ok(0, 1, json!(2));
    for handle in handles {
        outcome(handle).await.unwrap();
    }
}
