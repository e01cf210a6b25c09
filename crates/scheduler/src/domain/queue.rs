//! Pods waiting for a scheduling decision

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use api_types::{PodKey, PodSnapshot};
use priority_queue::PriorityQueue;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("pending queue is closed")]
    Closed,
}

/// What `add` does when the pod is already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Keep the queued snapshot
    IfAbsent,
    /// Swap in the new snapshot, keeping the queue position
    ReplaceExisting,
}

#[derive(Default)]
struct QueueState {
    order: PriorityQueue<PodKey, Reverse<u64>>,
    pods: HashMap<PodKey, PodSnapshot>,
    next_sequence: u64,
    closed: bool,
}

/// FIFO of pods keyed by pod identity; a pod is queued at most once.
#[derive(Default)]
pub struct PendingQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a pod. Returns whether the queue changed.
    pub fn add(&self, pod: PodSnapshot, mode: AddMode) -> bool {
        let key = pod.key();
        let mut state = self.state();
        if state.closed {
            return false;
        }

        if state.pods.contains_key(&key) {
            if mode == AddMode::IfAbsent {
                return false;
            }
            state.pods.insert(key.clone(), pod);
            tracing::trace!(pod = %key, "queued pod replaced");
            return true;
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.order.push(key.clone(), Reverse(sequence));
        state.pods.insert(key.clone(), pod);
        drop(state);

        tracing::debug!(pod = %key, "pod queued");
        self.available.notify_one();
        true
    }

    /// Waits for the oldest queued pod. Fails once the queue is closed.
    pub async fn pop(&self) -> Result<PodSnapshot, QueueError> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if let Some((key, _)) = state.order.pop() {
                    if let Some(pod) = state.pods.remove(&key) {
                        // Wake the next waiter if more work is left.
                        if !state.order.is_empty() {
                            self.available.notify_one();
                        }
                        return Ok(pod);
                    }
                }
            }

            notified.await;
        }
    }

    pub fn get(&self, key: &PodKey) -> Option<PodSnapshot> {
        self.state().pods.get(key).cloned()
    }

    /// Queued pods, oldest first.
    pub fn list(&self) -> Vec<PodSnapshot> {
        let state = self.state();
        let mut entries: Vec<_> = state
            .order
            .iter()
            .filter_map(|(key, Reverse(sequence))| {
                state.pods.get(key).map(|pod| (*sequence, pod.clone()))
            })
            .collect();
        entries.sort_by_key(|(sequence, _)| *sequence);
        entries.into_iter().map(|(_, pod)| pod).collect()
    }

    /// Removes a queued pod. Returns whether it was queued.
    pub fn delete(&self, key: &PodKey) -> bool {
        let mut state = self.state();
        let removed = state.order.remove(key).is_some();
        state.pods.remove(key);
        if removed {
            tracing::debug!(pod = %key, "pod dequeued");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state().pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the queue; every current and future `pop` returns `Closed`.
    pub fn close(&self) {
        self.state().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}
