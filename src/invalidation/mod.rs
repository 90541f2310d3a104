//! Invalidation scheduling.
//!
//! Confirmed writes are followed by a refresh of every cache region they can
//! affect. Operation names map to those regions through a static policy table,
//! and the batcher debounces and deduplicates the resulting requests so rapid
//! interaction costs one refresh per region rather than one per click.

mod batcher;
pub mod policy;

pub use batcher::{BatchConfig, InvalidateOptions, InvalidationBatcher, InvalidationRequest};
pub use policy::{OperationPolicy, Target, POLICIES};
