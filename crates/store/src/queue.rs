use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// A key handed to a worker, tagged with the key's generation at pop time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease<K> {
    pub key: K,
    pub generation: u64,
}

struct State<K> {
    order: VecDeque<K>,
    pending: FxHashSet<K>,
    in_flight: FxHashSet<K>,
    /// Re-added while in flight; requeued on `done`.
    dirty: FxHashSet<K>,
    generations: FxHashMap<K, u64>,
    /// Earliest pending timer per key.
    timers: FxHashMap<K, Instant>,
    shutdown: bool,
}

/// Coalescing FIFO work queue with single flight per key.
///
/// Adding a key that is already pending is a no-op; adding a key that a
/// worker holds marks it dirty so it runs once more after `done`. Every add
/// bumps the key's generation, which lets a worker detect that its result
/// was superseded while it ran.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                order: VecDeque::new(),
                pending: FxHashSet::default(),
                in_flight: FxHashSet::default(),
                dirty: FxHashSet::default(),
                generations: FxHashMap::default(),
                timers: FxHashMap::default(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutdown {
            return;
        }
        *st.generations.entry(key.clone()).or_insert(0) += 1;
        if st.in_flight.contains(&key) {
            st.dirty.insert(key);
            return;
        }
        if st.pending.insert(key.clone()) {
            st.order.push_back(key);
            gauge!("appset_queue_depth", st.order.len() as f64);
            drop(st);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed. Only the earliest timer per key
    /// is kept; a later deadline for a key that already has one is dropped.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let deadline = Instant::now() + delay;
        {
            let mut st = self.lock();
            if st.shutdown {
                return;
            }
            match st.timers.get(&key) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    st.timers.insert(key.clone(), deadline);
                }
            }
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut st = queue.lock();
                if st.timers.get(&key) == Some(&deadline) {
                    st.timers.remove(&key);
                    true
                } else {
                    false
                }
            };
            if fire {
                queue.add(key);
            }
        });
    }

    /// Next key to process; waits while the queue is empty. `None` after
    /// shutdown.
    pub async fn next(&self) -> Option<Lease<K>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutdown {
                    return None;
                }
                if let Some(key) = st.order.pop_front() {
                    st.pending.remove(&key);
                    st.in_flight.insert(key.clone());
                    let generation = st.generations.get(&key).copied().unwrap_or(0);
                    let more = !st.order.is_empty();
                    gauge!("appset_queue_depth", st.order.len() as f64);
                    drop(st);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(Lease { key, generation });
                }
            }
            notified.await;
        }
    }

    /// Current generation of `key`; compare with [`Lease::generation`].
    pub fn generation(&self, key: &K) -> u64 {
        self.lock().generations.get(key).copied().unwrap_or(0)
    }

    /// True when nothing re-added the lease's key since it was handed out.
    pub fn is_current(&self, lease: &Lease<K>) -> bool {
        self.generation(&lease.key) == lease.generation
    }

    /// Release a key taken with [`WorkQueue::next`].
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.in_flight.remove(key);
        if st.dirty.remove(key) && !st.shutdown && st.pending.insert(key.clone()) {
            debug!(key = ?key, "queue: requeue dirty key");
            st.order.push_back(key.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    /// Drop the key's generation counter once it is gone for good.
    pub fn forget(&self, key: &K) {
        let mut st = self.lock();
        if !st.pending.contains(key) && !st.in_flight.contains(key) {
            st.generations.remove(key);
            st.timers.remove(key);
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }
}
