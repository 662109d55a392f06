//! # flowmap
//!
//! Persistent tiered key-value maps for ambient, flow-local state.
//!
//! ## Overview
//!
//! A flow of execution (a request handler hopping across await points, a
//! task forking child tasks) carries ambient state: values attached to the
//! flow rather than to any particular thread. This crate provides the map
//! that carries such state:
//!
//! - **[`FlowMap`]**: an immutable map whose every write returns a new
//!   snapshot, leaving all previously captured snapshots untouched.
//!   Immutability is the concurrency strategy; reads need no locks.
//! - **[`FlowKey`]**: an opaque slot handle compared by identity, never by
//!   structural equality.
//! - **[`AmbientValue`] / [`ForkClone`]**: the payload trait and the
//!   optional capability to produce branch-local copies when a flow forks.
//!
//! Internally the map moves through size-tiered representations (inline
//! pairs, a bounded bucket, a hash map) so that the common near-empty case
//! stays allocation-light while large maps degrade gracefully to ordinary
//! hashing.
//!
//! ## Example
//!
//! ```rust
//! use flowmap::{FlowKey, FlowMap, shared};
//!
//! let trace_id = FlowKey::labeled("trace-id");
//!
//! // Writes layer new snapshots; nothing is ever mutated in place.
//! let root = FlowMap::empty().set(&trace_id, Some(shared(7_u64)), true);
//! let child = root.set(&trace_id, Some(shared(8_u64)), true);
//!
//! let read = |map: &FlowMap| {
//!     map.get(&trace_id)
//!         .and_then(|slot| slot.as_ref())
//!         .and_then(|value| value.downcast_ref::<u64>())
//!         .copied()
//! };
//! assert_eq!(read(&root), Some(7));
//! assert_eq!(read(&child), Some(8));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod key;
pub mod map;
pub mod value;

pub use key::FlowKey;
pub use map::{FlowMap, FlowMapIter};
pub use value::{AmbientValue, ForkClone, Slot, ValueRef, shared};

/// Prelude module for convenient imports.
///
/// # Usage
///
/// ```rust
/// use flowmap::prelude::*;
/// ```
pub mod prelude {
    pub use crate::key::FlowKey;
    pub use crate::map::{FlowMap, FlowMapIter};
    pub use crate::value::{AmbientValue, ForkClone, Slot, ValueRef, shared};
}
