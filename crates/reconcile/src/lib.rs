//! Desired/actual reconciliation of Applications owned by an ApplicationSet.
//!
//! [`plan`] diffs the rendered desired set against the live Applications and
//! decides what to create, update and delete; [`apply`] executes a plan
//! against an [`ApplicationStore`] with conflict re-reads and backoff.

#![forbid(unsafe_code)]

use appset_core::{Application, ApplicationSet, Condition, ObjectKey, Result};

mod apply;
pub mod memory;
mod plan;
pub mod retry;

pub use apply::{apply, ApplyOutcome};
pub use plan::{merge_templated, plan, Plan, Update, DEFAULT_PRESERVED_ANNOTATIONS};
pub use retry::{retry_with_backoff, RetryConfig};

/// Object store for Applications.
#[async_trait::async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Every Application in `namespace`; ownership is decided by the caller.
    async fn list_owned_candidates(&self, namespace: &str) -> Result<Vec<Application>>;
    /// Every Application in every namespace the store can see.
    async fn list_all(&self) -> Result<Vec<Application>>;
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Application>>;
    async fn create(&self, app: &Application) -> Result<Application>;
    /// Fails with `ReconcileConflict` when `app`'s resourceVersion is stale.
    async fn update(&self, app: &Application) -> Result<Application>;
    /// Requests deletion; finalizers are honoured by the sync engine.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Read access to ApplicationSets plus their status conditions.
#[async_trait::async_trait]
pub trait ApplicationSetStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ApplicationSet>>;
    async fn list(&self) -> Result<Vec<ApplicationSet>>;
    async fn write_conditions(&self, key: &ObjectKey, conditions: &[Condition]) -> Result<()>;
}
