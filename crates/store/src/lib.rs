//! In-RAM controller state: the coalescing per-key work queue and the
//! atomically swapped cluster registry snapshot.

#![forbid(unsafe_code)]

mod queue;
mod registry;

pub use queue::{Lease, WorkQueue};
pub use registry::{spawn_cluster_ingest, ClusterBuilder, ClusterDelta, ClusterRegistry, Coalescer};
