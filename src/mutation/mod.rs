//! Optimistic writes with snapshot rollback.

mod coordinator;
mod ledger;
mod snapshot;
mod transform;

pub use coordinator::{MutationCoordinator, OptimisticMutation, RemoteCall};
pub use snapshot::{Prior, Restore, Snapshot, SnapshotEntry};
pub use transform::{CustomTransform, Transform, UPDATED_AT};
