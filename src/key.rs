//! Identity-keyed handles for ambient slots.
//!
//! This module provides [`FlowKey`], the opaque handle under which ambient
//! values are stored in a [`FlowMap`](crate::FlowMap).
//!
//! # Identity, not structure
//!
//! Two keys are equal exactly when they originate from the same
//! [`FlowKey::new`] (or [`FlowKey::labeled`]) call; cloning a handle yields
//! an equal key, constructing a new one never does. The optional label is
//! purely diagnostic and is never consulted by equality or hashing.
//!
//! # Examples
//!
//! ```rust
//! use flowmap::FlowKey;
//!
//! let first = FlowKey::new();
//! let second = FlowKey::new();
//! assert_ne!(first, second);
//!
//! // A clone is the same key.
//! let alias = first.clone();
//! assert_eq!(first, alias);
//!
//! // Labels do not participate in identity.
//! let left = FlowKey::labeled("request-id");
//! let right = FlowKey::labeled("request-id");
//! assert_ne!(left, right);
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Backing allocation for a [`FlowKey`].
///
/// Each `KeySlot` lives in its own `Arc` allocation; that allocation's
/// address is the key's identity.
struct KeySlot {
    label: Option<&'static str>,
}

/// An opaque handle identifying one ambient slot.
///
/// `FlowKey` is cheap to clone (a reference-count bump) and is compared and
/// hashed by allocation identity. The component that defines an ambient
/// slot owns its key; maps only store additional handles to it.
///
/// # Examples
///
/// ```rust
/// use flowmap::FlowKey;
///
/// let key = FlowKey::labeled("deadline");
/// assert_eq!(key.label(), Some("deadline"));
/// ```
#[derive(Clone)]
pub struct FlowKey {
    slot: Arc<KeySlot>,
}

impl FlowKey {
    /// Creates a new key, distinct from every other key in the process.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use flowmap::FlowKey;
    ///
    /// let key = FlowKey::new();
    /// assert_eq!(key.label(), None);
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(KeySlot { label: None }),
        }
    }

    /// Creates a new key carrying a diagnostic label.
    ///
    /// The label shows up in `Debug` output only; two keys with the same
    /// label remain distinct.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use flowmap::FlowKey;
    ///
    /// let key = FlowKey::labeled("request-id");
    /// assert_eq!(format!("{key:?}"), "FlowKey(\"request-id\")");
    /// ```
    #[inline]
    #[must_use]
    pub fn labeled(label: &'static str) -> Self {
        Self {
            slot: Arc::new(KeySlot { label: Some(label) }),
        }
    }

    /// Returns the diagnostic label, if one was attached.
    #[inline]
    #[must_use]
    pub fn label(&self) -> Option<&'static str> {
        self.slot.label
    }
}

impl PartialEq for FlowKey {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl Eq for FlowKey {}

impl Hash for FlowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Identity hash: the backing allocation's address. The address
        // cannot be reused while any handle (including a stored clone)
        // keeps the allocation alive.
        (Arc::as_ptr(&self.slot) as usize).hash(state);
    }
}

impl fmt::Debug for FlowKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot.label {
            Some(label) => formatter.debug_tuple("FlowKey").field(&label).finish(),
            None => write!(formatter, "FlowKey({:p})", Arc::as_ptr(&self.slot)),
        }
    }
}

static_assertions::assert_impl_all!(FlowKey: Send, Sync, Clone);

// =============================================================================
// Tests
// =============================================================================
