//! Helpers shared by the process-backed integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use workfarm::{Facade, FarmBuilder, WorkerState};

pub const TIMEOUT: Duration = Duration::from_secs(20);

pub const DEMO_WORKER: &str = env!("CARGO_BIN_EXE_workfarm-demo-worker");

pub const DEMO_METHODS: &[&str] = &[
    "echo",
    "add",
    "fail",
    "sleep",
    "crash",
    "flaky",
    "blob",
    "pid",
    "worker_id",
    "calls",
    "setup_args",
    "progress",
    "count",
    "print",
];

/// Builder for a process farm running the demo worker.
pub fn demo_farm(workers: usize) -> FarmBuilder {
    FarmBuilder::new(DEMO_WORKER)
        .exported_methods(DEMO_METHODS.iter().copied())
        .num_workers(workers)
}

pub async fn settle<F: Future>(future: F) -> F::Output {
    timeout(TIMEOUT, future).await.expect("timed out")
}

/// Wait until every worker has connected and is idle.
pub async fn wait_until_idle(farm: &Facade) {
    settle(async {
        loop {
            let workers = farm.workers().await.unwrap();
            if workers.iter().all(|w| w.state == WorkerState::Idle) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
}
