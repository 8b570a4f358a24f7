//! Backlog of calls waiting for a worker.

use std::collections::{HashMap, VecDeque};

use workfarm_protocol::WorkerId;

use crate::call::Call;

/// FIFO of pending calls with sticky routing.
///
/// A call carrying a route key binds that key to the first worker that
/// takes it. Later calls with the same key are only handed to that worker;
/// when they reach the head of the shared queue they move to the worker's
/// pinned queue, which it drains before the shared one.
#[derive(Debug, Default)]
pub struct TaskQueue {
    shared: VecDeque<Call>,
    pinned: HashMap<WorkerId, VecDeque<Call>>,
    bindings: HashMap<String, WorkerId>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, call: Call) {
        self.shared.push_back(call);
    }

    /// Next call `worker` may run, if any.
    pub fn next_for(&mut self, worker: WorkerId) -> Option<Call> {
        if let Some(call) = self.pinned.get_mut(&worker).and_then(VecDeque::pop_front) {
            return Some(call);
        }

        while let Some(call) = self.shared.pop_front() {
            let owner = call
                .route_key
                .as_ref()
                .and_then(|key| self.bindings.get(key).copied());
            match owner {
                Some(owner) if owner != worker => {
                    self.pinned.entry(owner).or_default().push_back(call);
                }
                _ => {
                    if let Some(key) = &call.route_key {
                        self.bindings.insert(key.clone(), worker);
                    }
                    return Some(call);
                }
            }
        }
        None
    }

    /// Release a worker that will never run again: its pinned calls go back
    /// to the head of the shared queue and its route keys are forgotten.
    pub fn unpin_worker(&mut self, worker: WorkerId) {
        self.bindings.retain(|_, owner| *owner != worker);
        if let Some(pinned) = self.pinned.remove(&worker) {
            for call in pinned.into_iter().rev() {
                self.shared.push_front(call);
            }
        }
    }

    /// Remove every waiting call, pinned ones first.
    pub fn drain(&mut self) -> Vec<Call> {
        self.bindings.clear();
        let mut workers: Vec<WorkerId> = self.pinned.keys().copied().collect();
        workers.sort_unstable();
        let mut calls = Vec::with_capacity(self.len());
        for worker in workers {
            if let Some(pinned) = self.pinned.remove(&worker) {
                calls.extend(pinned);
            }
        }
        calls.extend(self.shared.drain(..));
        calls
    }

    pub fn len(&self) -> usize {
        self.shared.len() + self.pinned.values().map(VecDeque::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallOptions;

    fn call(method: &str) -> Call {
        Call::new(method, vec![], false, CallOptions::new()).0
    }

    fn routed(method: &str, key: &str) -> Call {
        Call::new(method, vec![], false, CallOptions::new().route_key(key)).0
    }

    fn method(call: Option<Call>) -> String {
        call.map(|c| c.method).unwrap_or_default()
    }

    #[test]
    fn fifo_without_routing() {
        let mut q = TaskQueue::new();
        q.push(call("a"));
        q.push(call("b"));
        q.push(call("c"));
        assert_eq!(method(q.next_for(0)), "a");
        assert_eq!(method(q.next_for(1)), "b");
        assert_eq!(method(q.next_for(0)), "c");
        assert!(q.next_for(0).is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn routed_calls_stick_to_first_worker() {
        let mut q = TaskQueue::new();
        q.push(routed("a1", "file-a"));
        q.push(routed("a2", "file-a"));
        q.push(call("x"));

        assert_eq!(method(q.next_for(0)), "a1");
        // Worker 1 skips the call bound to worker 0.
        assert_eq!(method(q.next_for(1)), "x");
        assert_eq!(q.len(), 1);
        assert!(q.next_for(1).is_none());
        assert_eq!(method(q.next_for(0)), "a2");
    }

    #[test]
    fn pinned_calls_keep_submission_order() {
        let mut q = TaskQueue::new();
        q.push(routed("k1", "k"));
        assert_eq!(method(q.next_for(2)), "k1");
        q.push(routed("k2", "k"));
        q.push(routed("k3", "k"));
        assert!(q.next_for(0).is_none());
        assert_eq!(method(q.next_for(2)), "k2");
        assert_eq!(method(q.next_for(2)), "k3");
    }

    #[test]
    fn unpinned_calls_return_to_the_front() {
        let mut q = TaskQueue::new();
        q.push(routed("k1", "k"));
        assert_eq!(method(q.next_for(0)), "k1");
        q.push(routed("k2", "k"));
        q.push(call("later"));
        assert_eq!(method(q.next_for(1)), "later");

        q.unpin_worker(0);
        // Key binding is gone, so any worker may take k2 and rebind it.
        assert_eq!(method(q.next_for(1)), "k2");
        q.push(routed("k3", "k"));
        assert!(q.next_for(0).is_none());
        assert_eq!(method(q.next_for(1)), "k3");
    }

    #[test]
    fn drain_empties_everything() {
        let mut q = TaskQueue::new();
        q.push(routed("k1", "k"));
        q.next_for(0);
        q.push(routed("k2", "k"));
        q.push(call("x"));
        q.next_for(1);
        q.push(call("y"));

        let drained: Vec<String> = q.drain().into_iter().map(|c| c.method).collect();
        assert_eq!(drained, vec!["k2", "y"]);
        assert!(q.is_empty());
    }
}
