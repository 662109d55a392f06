//! Ambient payloads and the fork-clone capability.
//!
//! This module defines [`AmbientValue`], the trait every payload stored in a
//! [`FlowMap`](crate::FlowMap) implements, and [`ForkClone`], the optional
//! capability a payload exposes when a forked flow must receive its own
//! independent copy of the value.
//!
//! # Sharing by default
//!
//! Stored values are handed out as [`ValueRef`] (`Arc<dyn AmbientValue>`)
//! and are shared unchanged across snapshots and forks. Only values that
//! opt into [`ForkClone`] are copied at fork boundaries; everything else
//! rides along by reference.
//!
//! # Examples
//!
//! A payload that wants branch-local independence implements both traits:
//!
//! ```rust
//! use flowmap::{AmbientValue, ForkClone, ValueRef};
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct Scratchpad {
//!     lines: Vec<String>,
//! }
//!
//! impl AmbientValue for Scratchpad {
//!     fn as_fork_clone(&self) -> Option<&dyn ForkClone> {
//!         Some(self)
//!     }
//! }
//!
//! impl ForkClone for Scratchpad {
//!     fn fork_clone(&self) -> ValueRef {
//!         Arc::new(Self {
//!             lines: self.lines.clone(),
//!         })
//!     }
//! }
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

// =============================================================================
// Payload Traits
// =============================================================================

/// A payload that can be stored in a [`FlowMap`](crate::FlowMap).
///
/// Implementations must be shareable across threads, since the same value
/// instance may be referenced by snapshots held on any number of flows.
///
/// Plain data types can implement the trait with an empty body; this crate
/// already does so for the common scalar and string types.
pub trait AmbientValue: Any + Send + Sync + fmt::Debug {
    /// Exposes the fork-clone capability, if this value supports it.
    ///
    /// The answer must be consistent for every instance of one concrete
    /// type over the whole process lifetime; fork operations memoize it
    /// per type.
    fn as_fork_clone(&self) -> Option<&dyn ForkClone> {
        None
    }
}

/// The capability to produce a branch-local copy at a fork boundary.
///
/// Invoked only by [`FlowMap::fork`](crate::FlowMap::fork). A panic raised
/// here propagates to the `fork` caller; it is never swallowed, since
/// silently sharing an un-cloned mutable value across branches would break
/// isolation.
pub trait ForkClone: AmbientValue {
    /// Returns an independent copy of this value for a diverging flow.
    fn fork_clone(&self) -> ValueRef;
}

/// A shared handle to a stored payload.
pub type ValueRef = Arc<dyn AmbientValue>;

/// One stored slot: a payload, or an explicitly written absent payload.
///
/// `None` only occurs in maps written with `treat_none_as_absent == false`;
/// under the removing policy an absent write drops the entry instead.
pub type Slot = Option<ValueRef>;

impl dyn AmbientValue {
    /// Returns a reference to the concrete payload, if it is a `T`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use flowmap::{ValueRef, shared};
    ///
    /// let value: ValueRef = shared(42_i32);
    /// assert_eq!(value.downcast_ref::<i32>(), Some(&42));
    /// assert_eq!(value.downcast_ref::<String>(), None);
    /// ```
    #[must_use]
    pub fn downcast_ref<T: AmbientValue>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }

    /// Returns `true` if the concrete payload is a `T`.
    #[must_use]
    pub fn is<T: AmbientValue>(&self) -> bool {
        (self as &dyn Any).is::<T>()
    }
}

/// Wraps a payload into a shared [`ValueRef`].
///
/// # Examples
///
/// ```rust
/// use flowmap::shared;
///
/// let value = shared("hello".to_string());
/// assert_eq!(value.downcast_ref::<String>().map(String::as_str), Some("hello"));
/// ```
#[inline]
#[must_use]
pub fn shared<T: AmbientValue>(payload: T) -> ValueRef {
    Arc::new(payload)
}

macro_rules! impl_ambient_value {
    ($($payload:ty),* $(,)?) => {
        $(
            impl AmbientValue for $payload {}
        )*
    };
}

// Plain payload types: shared unchanged across forks.
impl_ambient_value!(
    bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, String,
    &'static str,
);

// =============================================================================
// Capability Cache
// =============================================================================

/// Memoized "does this concrete type expose [`ForkClone`]" answers.
///
/// Read-mostly: a type is probed once, every later fork hits the read path.
static FORK_CLONE_SUPPORT: LazyLock<RwLock<FxHashMap<TypeId, bool>>> =
    LazyLock::new(|| RwLock::new(FxHashMap::default()));

/// Returns whether `value`'s concrete type exposes the fork-clone
/// capability, consulting the per-type cache before dispatching.
pub(crate) fn supports_fork_clone(value: &dyn AmbientValue) -> bool {
    let type_id = value.type_id();
    if let Some(&supported) = FORK_CLONE_SUPPORT.read().get(&type_id) {
        return supported;
    }

    let supported = value.as_fork_clone().is_some();
    FORK_CLONE_SUPPORT.write().insert(type_id, supported);
    supported
}

static_assertions::assert_obj_safe!(AmbientValue, ForkClone);
static_assertions::assert_impl_all!(ValueRef: Send, Sync, Clone);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[derive(Debug)]
    struct Plain(u8);

    impl AmbientValue for Plain {}

    #[derive(Debug)]
    struct Copied(u8);

    impl AmbientValue for Copied {
        fn as_fork_clone(&self) -> Option<&dyn ForkClone> {
            Some(self)
        }
    }

    impl ForkClone for Copied {
        fn fork_clone(&self) -> ValueRef {
            Arc::new(Self(self.0))
        }
    }

    #[rstest]
    fn test_downcast_ref_round_trip() {
        let value = shared(7_i64);
        assert_eq!(value.downcast_ref::<i64>(), Some(&7));
        assert!(value.downcast_ref::<u64>().is_none());
        assert!(value.is::<i64>());
    }

    #[rstest]
    fn test_plain_value_has_no_capability() {
        let value = shared(Plain(1));
        assert!(!supports_fork_clone(value.as_ref()));
        // Second probe answers from the cache.
        assert!(!supports_fork_clone(value.as_ref()));
    }

    #[rstest]
    fn test_capability_is_detected_and_memoized() {
        let value = shared(Copied(3));
        assert!(supports_fork_clone(value.as_ref()));
        assert!(supports_fork_clone(value.as_ref()));

        let copy = value
            .as_fork_clone()
            .expect("capability advertised above")
            .fork_clone();
        assert_eq!(copy.downcast_ref::<Copied>().map(|copied| copied.0), Some(3));
        assert!(!Arc::ptr_eq(&value, &copy));
    }

    #[rstest]
    fn test_shared_scalar_types_are_plain() {
        assert!(!supports_fork_clone(shared(true).as_ref()));
        assert!(!supports_fork_clone(shared(2.5_f64).as_ref()));
        assert!(!supports_fork_clone(shared("static").as_ref()));
    }
}
