//! Client-side cache consistency engine for a newsletter reader.
//!
//! Reads go through a structured query cache keyed by entity, scope and
//! normalized filters. Writes are applied optimistically to every cached copy,
//! rolled back if the backend rejects them, and followed by a debounced,
//! policy-driven refresh of the regions they may have changed.

pub mod cache;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod logging;
pub mod mutation;
pub mod newsletters;
pub mod query;
pub mod remote;
