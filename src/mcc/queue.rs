//! A fair, rate-limited work queue. Requests are bucketed per tenant cluster
//! and dequeued round-robin so one tenant's burst cannot starve the others.
//! A key that is being processed is never handed out again until `done`;
//! re-adds during processing are parked and released afterwards.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

/// One unit of work: a (cluster, namespace, name) key plus the tenant UID
/// observed when the event fired. Identity ignores the UID.
#[derive(Debug, Clone)]
pub struct Request {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl Request {
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.cluster, self.namespace, self.name)
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.cluster == other.cluster
            && self.namespace == other.namespace
            && self.name == other.name
    }
}
impl Eq for Request {}

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct QueueState {
    per_cluster: BTreeMap<String, VecDeque<Request>>,
    /// Keys currently sitting in a per-cluster bucket.
    queued: HashSet<String>,
    /// Keys handed to a worker and not yet `done`.
    active: HashSet<String>,
    /// Re-adds that arrived while the key was active.
    parked: HashMap<String, Request>,
    retries: HashMap<String, u32>,
    /// Round-robin position over the cluster buckets.
    cursor: usize,
    shutdown: bool,
}

impl QueueState {
    fn try_pop(&mut self) -> Option<Request> {
        let clusters: Vec<String> = self.per_cluster.keys().cloned().collect();
        if clusters.is_empty() {
            return None;
        }
        for offset in 0..clusters.len() {
            let cluster = &clusters[(self.cursor + offset) % clusters.len()];
            let bucket = match self.per_cluster.get_mut(cluster) {
                Some(b) => b,
                None => continue,
            };
            // Skip over keys whose previous reconcile is still running.
            let idx = bucket.iter().position(|r| !self.active.contains(&r.key()));
            if let Some(idx) = idx {
                let req = bucket.remove(idx).expect("index in range");
                if bucket.is_empty() {
                    self.per_cluster.remove(cluster);
                }
                self.cursor = (self.cursor + offset + 1) % clusters.len().max(1);
                self.queued.remove(&req.key());
                self.active.insert(req.key());
                return Some(req);
            }
        }
        None
    }

    fn is_drained(&self) -> bool {
        self.per_cluster.is_empty() && self.active.is_empty() && self.parked.is_empty()
    }

    fn push(&mut self, req: Request) -> bool {
        let key = req.key();
        if self.shutdown || self.queued.contains(&key) {
            return false;
        }
        if self.active.contains(&key) {
            self.parked.insert(key, req);
            return false;
        }
        self.queued.insert(key);
        self.per_cluster
            .entry(req.cluster.clone())
            .or_default()
            .push_back(req);
        true
    }
}

pub struct FairQueue {
    state: std::sync::Mutex<QueueState>,
    notify: Notify,
}

impl FairQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: std::sync::Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueues a request unless an identical key is already pending.
    pub fn add(&self, req: Request) {
        let pushed = match self.state.lock() {
            Ok(mut state) => state.push(req),
            Err(_) => false,
        };
        if pushed {
            self.notify.notify_waiters();
        }
    }

    /// Enqueues after a delay without blocking the caller.
    pub fn add_after(self: &Arc<Self>, req: Request, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(req);
        });
    }

    /// Exponential per-item backoff, 5ms doubling up to 1000s.
    pub fn add_rate_limited(self: &Arc<Self>, req: Request) -> Duration {
        let attempt = match self.state.lock() {
            Ok(mut state) => {
                let n = state.retries.entry(req.key()).or_insert(0);
                *n = n.saturating_add(1);
                *n
            }
            Err(_) => 1,
        };
        let exp = attempt.saturating_sub(1).min(28);
        let delay = BASE_DELAY
            .checked_mul(1u32 << exp)
            .map(|d| d.min(MAX_DELAY))
            .unwrap_or(MAX_DELAY);
        self.add_after(req, delay);
        delay
    }

    pub fn retry_count(&self, req: &Request) -> u32 {
        self.state
            .lock()
            .map(|s| s.retries.get(&req.key()).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Clears the retry history after a successful reconcile.
    pub fn forget(&self, req: &Request) {
        if let Ok(mut state) = self.state.lock() {
            state.retries.remove(&req.key());
        }
    }

    /// Releases a key after its reconcile finished; anything parked for it
    /// while it ran is queued now.
    pub fn done(&self, req: &Request) {
        let released = match self.state.lock() {
            Ok(mut state) => {
                state.active.remove(&req.key());
                if let Some(parked) = state.parked.remove(&req.key()) {
                    state.push(parked)
                } else {
                    // A waiter may be parked on the drained condition.
                    state.shutdown
                }
            }
            Err(_) => false,
        };
        if released {
            self.notify.notify_waiters();
        }
    }

    /// Blocks until work is available. Returns `None` once the queue has
    /// shut down and drained.
    pub async fn next(&self) -> Option<Request> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = match self.state.lock() {
                    Ok(s) => s,
                    Err(_) => return None,
                };
                if let Some(req) = state.try_pop() {
                    return Some(req);
                }
                if state.shutdown && state.is_drained() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops accepting new work; `next` returns `None` once drained.
    pub fn shut_down(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.shutdown = true;
        }
        debug!("queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.per_cluster.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
