use std::collections::VecDeque;
use std::sync::Arc;

use appset_core::{ClusterInfo, ClusterSnapshot, DeltaKind};
use arc_swap::ArcSwap;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Change to one cluster secret. `cluster` is `None` for deletions.
#[derive(Debug, Clone)]
pub struct ClusterDelta {
    pub kind: DeltaKind,
    /// `namespace/name` of the backing secret.
    pub secret: String,
    pub cluster: Option<ClusterInfo>,
}

/// Coalescing buffer keyed by secret with FIFO order. Only the latest delta
/// per secret survives until the next drain.
pub struct Coalescer {
    map: FxHashMap<String, ClusterDelta>,
    order: VecDeque<String>,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::with_capacity_and_hasher(cap, Default::default()), order: VecDeque::with_capacity(cap) }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn push(&mut self, d: ClusterDelta) {
        if !self.map.contains_key(&d.secret) {
            self.order.push_back(d.secret.clone());
        }
        self.map.insert(d.secret.clone(), d);
    }

    pub fn drain_ready(&mut self) -> Vec<ClusterDelta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(secret) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&secret) {
                out.push(d);
            }
        }
        out
    }
}

/// Builds cluster snapshots from secret deltas.
#[derive(Default)]
pub struct ClusterBuilder {
    epoch: u64,
    items: FxHashMap<String, ClusterInfo>,
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, batch: Vec<ClusterDelta>) {
        for d in batch {
            match (d.kind, d.cluster) {
                (DeltaKind::Applied, Some(c)) => {
                    self.items.insert(d.secret, c);
                }
                // A secret that stops parsing as a cluster drops out.
                (DeltaKind::Applied, None) | (DeltaKind::Deleted, _) => {
                    self.items.remove(&d.secret);
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<ClusterSnapshot> {
        Arc::new(ClusterSnapshot::new(self.epoch, self.items.values().cloned().collect()))
    }
}

/// Read handle on the current cluster snapshot plus an epoch channel that
/// ticks on every swap. Evaluations take one snapshot and keep it.
#[derive(Clone)]
pub struct ClusterRegistry {
    snap: Arc<ArcSwap<ClusterSnapshot>>,
    epoch_tx: Arc<watch::Sender<u64>>,
    epoch_rx: watch::Receiver<u64>,
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        Self { snap: Arc::new(ArcSwap::from_pointee(ClusterSnapshot::default())), epoch_tx: Arc::new(epoch_tx), epoch_rx }
    }
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding a fixed cluster list.
    pub fn fixed(clusters: Vec<ClusterInfo>) -> Self {
        let reg = Self::new();
        reg.publish(Arc::new(ClusterSnapshot::new(1, clusters)));
        reg
    }

    pub fn current(&self) -> Arc<ClusterSnapshot> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }

    /// Swap in `next` and notify epoch subscribers.
    pub fn publish(&self, next: Arc<ClusterSnapshot>) {
        let epoch = next.epoch;
        gauge!("appset_clusters", next.clusters.len() as f64);
        self.snap.store(next);
        self.epoch_tx.send_replace(epoch);
        counter!("appset_cluster_snapshot_swaps_total", 1u64);
    }
}

/// Spawn the ingest loop: deltas are coalesced per secret and folded into a
/// new snapshot on each tick. Returns the delta sender.
pub fn spawn_cluster_ingest(registry: ClusterRegistry, cap: usize) -> mpsc::Sender<ClusterDelta> {
    let (tx, mut rx) = mpsc::channel::<ClusterDelta>(cap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = ClusterBuilder::new();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => coalescer.push(d),
                        None => {
                            debug!("cluster delta channel closed; draining and exiting ingest loop");
                            flush(&mut coalescer, &mut builder, &registry);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => flush(&mut coalescer, &mut builder, &registry),
            }
        }
        info!("cluster ingest loop stopped");
    });

    tx
}

fn flush(coalescer: &mut Coalescer, builder: &mut ClusterBuilder, registry: &ClusterRegistry) {
    let batch = coalescer.drain_ready();
    if batch.is_empty() {
        return;
    }
    debug!(deltas = batch.len(), "cluster ingest: applying batch");
    builder.apply(batch);
    registry.publish(builder.freeze());
}
