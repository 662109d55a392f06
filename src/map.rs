//! Persistent tiered map carrying ambient flow-local state.
//!
//! This module provides [`FlowMap`], an immutable key-value map with
//! automatic representation transitions driven purely by entry count.
//!
//! # Overview
//!
//! Ambient state is read far more often than it is written, and the same
//! snapshot may be captured by many concurrently progressing flows. `FlowMap`
//! therefore never mutates in place: every write produces a new map value and
//! leaves every existing reference untouched, which is the entire concurrency
//! strategy. To keep the common tiny maps cheap, the map picks one of six
//! representations by entry count:
//!
//! | Entries | Representation                          |
//! |---------|-----------------------------------------|
//! | 0       | the process-wide empty singleton        |
//! | 1       | one inline pair                         |
//! | 2       | two inline pairs                        |
//! | 3       | three inline pairs                      |
//! | 4..=16  | inline bucket (`ArrayVec`)              |
//! | 17+     | hash map keyed by handle identity       |
//!
//! # Time Complexity
//!
//! | Operation      | One/Two/Three | Bucket (k <= 16) | Many          |
//! |----------------|---------------|------------------|---------------|
//! | `get`          | O(1)          | O(k)             | O(1) expected |
//! | `set`          | O(1)          | O(k)             | O(n)          |
//! | `fork`         | O(n)          | O(n)             | O(n)          |
//! | `len`          | O(1)          | O(1)             | O(1)          |
//! | `is_empty`     | O(1)          | O(1)             | O(1)          |
//!
//! `get` never allocates in any representation.
//!
//! # Representation Transitions
//!
//! ```text
//!          insert        insert        insert         insert          insert (n == 16)
//!   Empty ───────► One ───────► Two ───────► Three ───────► Bucket ───────► Many
//!   Empty ◄─────── One ◄─────── Two ◄─────── Three ◄─────── Bucket ◄─────── Many
//!          remove        remove        remove       remove (n == 4)  remove (n == 17)
//! ```
//!
//! Transitions happen one class at a time in both directions, so removing an
//! entry always lands on the representation that the same number of fresh
//! inserts would have produced.
//!
//! # Examples
//!
//! ```rust
//! use flowmap::{FlowKey, FlowMap, shared};
//!
//! let request_id = FlowKey::labeled("request-id");
//! let deadline = FlowKey::labeled("deadline");
//!
//! let map = FlowMap::empty()
//!     .set(&request_id, Some(shared(17_u64)), true)
//!     .set(&deadline, Some(shared("soon")), true);
//!
//! let slot = map.get(&request_id).expect("written above");
//! let value = slot.as_ref().expect("payload written above");
//! assert_eq!(value.downcast_ref::<u64>(), Some(&17));
//!
//! // Writes never disturb existing snapshots.
//! let trimmed = map.set(&deadline, None, true);
//! assert_eq!(trimmed.len(), 1);
//! assert_eq!(map.len(), 2);
//! ```

use std::fmt;
use std::sync::{Arc, LazyLock};

use arrayvec::ArrayVec;
use rustc_hash::{FxBuildHasher, FxHashMap};

use crate::key::FlowKey;
use crate::value::{self, Slot};

// =============================================================================
// Constants
// =============================================================================

/// Largest entry count held by the inline bucket representation; one more
/// entry promotes the map to the hash-backed representation.
const BUCKET_CAPACITY: usize = 16;

/// Smallest entry count held by the inline bucket representation; one fewer
/// entry demotes the map to three inline pairs.
const BUCKET_FLOOR: usize = 4;

// =============================================================================
// Inner Representation
// =============================================================================

/// One stored key-value pair.
#[derive(Clone)]
struct Pair {
    key: FlowKey,
    value: Slot,
}

/// Internal representation, selected purely by entry count.
enum FlowMapInner {
    /// Zero entries. Only the process-wide singleton holds this state.
    Empty,
    /// Exactly one entry, stored inline.
    One(Pair),
    /// Exactly two entries, stored inline.
    Two { first: Pair, second: Pair },
    /// Exactly three entries, stored inline.
    Three {
        first: Pair,
        second: Pair,
        third: Pair,
    },
    /// Four to sixteen entries in an inline array.
    Bucket(ArrayVec<Pair, BUCKET_CAPACITY>),
    /// Seventeen or more entries in a hash map keyed by handle identity.
    Many(FxHashMap<FlowKey, Slot>),
}

/// The process-wide empty map. Never deallocated, never mutated; every
/// zero-entry result aliases it so emptiness checks are pointer comparisons.
static EMPTY: LazyLock<FlowMap> = LazyLock::new(|| FlowMap {
    inner: Arc::new(FlowMapInner::Empty),
});

// =============================================================================
// FlowMap Definition
// =============================================================================

/// A persistent map from [`FlowKey`] to ambient value slots.
///
/// `FlowMap` is an immutable snapshot: [`set`](Self::set) returns a new map
/// and leaves the receiver untouched, so any number of flows may hold and
/// read the same snapshot without synchronization. Keys are compared by
/// handle identity, never by any structural notion of equality.
///
/// Rust's [`Clone`] on this type is a cheap handle clone producing the
/// *same* snapshot; producing an independent snapshot for a diverging flow
/// is [`fork`](Self::fork).
///
/// # Examples
///
/// ```rust
/// use flowmap::{FlowKey, FlowMap, shared};
///
/// let key = FlowKey::new();
/// let map = FlowMap::with_entry(&key, Some(shared(1_i32)), true);
/// assert_eq!(map.len(), 1);
/// assert!(map.contains_key(&key));
/// ```
#[derive(Clone)]
pub struct FlowMap {
    inner: Arc<FlowMapInner>,
}

impl FlowMap {
    /// Returns the empty map.
    ///
    /// This is the canonical process-wide instance: every call (and every
    /// operation that drops the last entry) hands out the same allocation,
    /// so entering and leaving ambient scopes never allocates.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use flowmap::FlowMap;
    ///
    /// let first = FlowMap::empty();
    /// let second = FlowMap::empty();
    /// assert!(FlowMap::ptr_eq(&first, &second));
    /// ```
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        EMPTY.clone()
    }

    /// Creates a map holding a single entry.
    ///
    /// Equivalent to `FlowMap::empty().set(key, value, treat_none_as_absent)`
    /// without touching the singleton first.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use flowmap::{FlowKey, FlowMap, shared};
    ///
    /// let key = FlowKey::new();
    /// let map = FlowMap::with_entry(&key, Some(shared("payload")), true);
    /// assert_eq!(map.len(), 1);
    ///
    /// // An absent payload under the removing policy yields the empty map.
    /// let empty = FlowMap::with_entry(&key, None, true);
    /// assert!(empty.is_empty());
    /// ```
    #[must_use]
    pub fn with_entry(key: &FlowKey, value: Slot, treat_none_as_absent: bool) -> Self {
        if treat_none_as_absent && value.is_none() {
            Self::empty()
        } else {
            Self::one(Pair {
                key: key.clone(),
                value,
            })
        }
    }

    /// Returns `true` if this map is the empty singleton.
    ///
    /// An identity comparison, never a traversal.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        Arc::ptr_eq(&self.inner, &EMPTY.inner)
    }

    /// Returns `true` if `this` and `other` are the same snapshot.
    ///
    /// The no-op short-circuits in [`set`](Self::set) and
    /// [`fork`](Self::fork) guarantee that an unchanged result *is* the
    /// receiver, so callers deciding whether a change notification is owed
    /// can rely on this comparison alone.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use flowmap::{FlowKey, FlowMap};
    ///
    /// let key = FlowKey::new();
    /// let map = FlowMap::empty();
    /// let same = map.set(&key, None, true);
    /// assert!(FlowMap::ptr_eq(&map, &same));
    /// ```
    #[inline]
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }

    /// Returns the number of entries in the map.
    ///
    /// # Complexity
    ///
    /// O(1) for every representation.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        match &*self.inner {
            FlowMapInner::Empty => 0,
            FlowMapInner::One(_) => 1,
            FlowMapInner::Two { .. } => 2,
            FlowMapInner::Three { .. } => 3,
            FlowMapInner::Bucket(entries) => entries.len(),
            FlowMapInner::Many(entries) => entries.len(),
        }
    }

    /// Returns the slot stored under `key`, if the key is present.
    ///
    /// The outer `Option` is presence; the slot itself may be `None` when an
    /// explicitly absent payload was written under the persisting policy.
    /// Never allocates and has no side effects.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use flowmap::{FlowKey, FlowMap, shared};
    ///
    /// let key = FlowKey::new();
    /// let other = FlowKey::new();
    /// let map = FlowMap::with_entry(&key, Some(shared(5_i32)), true);
    ///
    /// assert!(map.get(&key).is_some());
    /// assert!(map.get(&other).is_none());
    /// ```
    #[must_use]
    pub fn get(&self, key: &FlowKey) -> Option<&Slot> {
        match &*self.inner {
            FlowMapInner::Empty => None,
            FlowMapInner::One(entry) => (entry.key == *key).then(|| &entry.value),
            FlowMapInner::Two { first, second } => {
                if first.key == *key {
                    Some(&first.value)
                } else if second.key == *key {
                    Some(&second.value)
                } else {
                    None
                }
            }
            FlowMapInner::Three {
                first,
                second,
                third,
            } => {
                if first.key == *key {
                    Some(&first.value)
                } else if second.key == *key {
                    Some(&second.value)
                } else if third.key == *key {
                    Some(&third.value)
                } else {
                    None
                }
            }
            FlowMapInner::Bucket(entries) => entries
                .iter()
                .find(|entry| entry.key == *key)
                .map(|entry| &entry.value),
            FlowMapInner::Many(entries) => entries.get(key),
        }
    }

    /// Returns `true` if the map holds an entry for `key`.
    #[inline]
    #[must_use]
    pub fn contains_key(&self, key: &FlowKey) -> bool {
        self.get(key).is_some()
    }

    /// Writes, replaces, or removes the entry for `key`, returning the
    /// resulting snapshot. The receiver is never modified.
    ///
    /// The one mutation primitive:
    ///
    /// - `Some(value)`, or `None` with `treat_none_as_absent == false`,
    ///   (re)writes the slot. Replacing an existing key keeps its position
    ///   and representation class; inserting a new key grows the count and
    ///   promotes the representation one class when its capacity is
    ///   exceeded.
    /// - `None` with `treat_none_as_absent == true` removes the key. When
    ///   the key is absent this is a no-op and the *receiver itself* is
    ///   returned, so snapshot identity is preserved. When present, the
    ///   result is one size class smaller.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use flowmap::{FlowKey, FlowMap, shared};
    ///
    /// let key = FlowKey::new();
    /// let map = FlowMap::empty();
    ///
    /// // Removing an absent key returns the receiver itself.
    /// let same = map.set(&key, None, true);
    /// assert!(FlowMap::ptr_eq(&map, &same));
    ///
    /// let written = map.set(&key, Some(shared("x")), true);
    /// assert_eq!(written.len(), 1);
    /// assert_eq!(map.len(), 0);
    ///
    /// // Under the persisting policy an absent payload is a real entry.
    /// let pinned = map.set(&key, None, false);
    /// assert_eq!(pinned.len(), 1);
    /// assert!(pinned.get(&key).is_some_and(Option::is_none));
    /// ```
    #[must_use]
    pub fn set(&self, key: &FlowKey, value: Slot, treat_none_as_absent: bool) -> Self {
        let removing = treat_none_as_absent && value.is_none();

        match &*self.inner {
            FlowMapInner::Empty => {
                if removing {
                    self.clone()
                } else {
                    Self::one(Pair {
                        key: key.clone(),
                        value,
                    })
                }
            }
            FlowMapInner::One(entry) => self.set_in_one(entry, key, value, removing),
            FlowMapInner::Two { first, second } => {
                self.set_in_two(first, second, key, value, removing)
            }
            FlowMapInner::Three {
                first,
                second,
                third,
            } => self.set_in_three(first, second, third, key, value, removing),
            FlowMapInner::Bucket(entries) => self.set_in_bucket(entries, key, value, removing),
            FlowMapInner::Many(entries) => self.set_in_many(entries, key, value, removing),
        }
    }

    /// Produces a snapshot for a diverging flow.
    ///
    /// Every stored value exposing the [`ForkClone`](crate::ForkClone)
    /// capability is replaced by its branch-local copy; all other values are
    /// shared unchanged. When no stored value requires copying the receiver
    /// itself is returned, so forking a clone-free context costs nothing.
    ///
    /// The result always has the same keys and the same representation class
    /// as the receiver.
    ///
    /// # Panics
    ///
    /// Propagates any panic raised by a value's `fork_clone`, and panics if
    /// a concrete value type answers the capability probe inconsistently.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use flowmap::{FlowKey, FlowMap, shared};
    ///
    /// let key = FlowKey::new();
    /// let map = FlowMap::with_entry(&key, Some(shared(9_i32)), true);
    ///
    /// // No stored value opts into fork-cloning, so the fork is free.
    /// let branch = map.fork();
    /// assert!(FlowMap::ptr_eq(&map, &branch));
    /// ```
    #[must_use]
    pub fn fork(&self) -> Self {
        let requires_fork = self.iter().any(|(_, slot)| slot_requires_fork(slot));
        if !requires_fork {
            return self.clone();
        }

        let forked = match &*self.inner {
            FlowMapInner::Empty => return self.clone(),
            FlowMapInner::One(entry) => FlowMapInner::One(forked_pair(entry)),
            FlowMapInner::Two { first, second } => FlowMapInner::Two {
                first: forked_pair(first),
                second: forked_pair(second),
            },
            FlowMapInner::Three {
                first,
                second,
                third,
            } => FlowMapInner::Three {
                first: forked_pair(first),
                second: forked_pair(second),
                third: forked_pair(third),
            },
            FlowMapInner::Bucket(entries) => {
                FlowMapInner::Bucket(entries.iter().map(forked_pair).collect())
            }
            FlowMapInner::Many(entries) => {
                let mut copied =
                    FxHashMap::with_capacity_and_hasher(entries.len(), FxBuildHasher::default());
                for (stored, slot) in entries {
                    copied.insert(stored.clone(), forked_slot(slot));
                }
                FlowMapInner::Many(copied)
            }
        };

        Self::from_inner(forked)
    }

    /// Returns an iterator over the entries, in no particular order.
    ///
    /// Creating and driving the iterator never allocates.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use flowmap::{FlowKey, FlowMap, shared};
    ///
    /// let first = FlowKey::new();
    /// let second = FlowKey::new();
    /// let map = FlowMap::empty()
    ///     .set(&first, Some(shared(1_i32)), true)
    ///     .set(&second, Some(shared(2_i32)), true);
    ///
    /// assert_eq!(map.iter().count(), 2);
    /// ```
    #[must_use]
    pub fn iter(&self) -> FlowMapIter<'_> {
        let inner = match &*self.inner {
            FlowMapInner::Empty => FlowMapIterInner::Fixed {
                entries: [None, None, None],
                index: 0,
            },
            FlowMapInner::One(entry) => FlowMapIterInner::Fixed {
                entries: [Some((&entry.key, &entry.value)), None, None],
                index: 0,
            },
            FlowMapInner::Two { first, second } => FlowMapIterInner::Fixed {
                entries: [
                    Some((&first.key, &first.value)),
                    Some((&second.key, &second.value)),
                    None,
                ],
                index: 0,
            },
            FlowMapInner::Three {
                first,
                second,
                third,
            } => FlowMapIterInner::Fixed {
                entries: [
                    Some((&first.key, &first.value)),
                    Some((&second.key, &second.value)),
                    Some((&third.key, &third.value)),
                ],
                index: 0,
            },
            FlowMapInner::Bucket(entries) => FlowMapIterInner::Bucket(entries.iter()),
            FlowMapInner::Many(entries) => FlowMapIterInner::Many(entries.iter()),
        };

        FlowMapIter { inner }
    }

    /// Returns an iterator over the keys, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &FlowKey> {
        self.iter().map(|(key, _)| key)
    }

    /// Returns an iterator over the stored slots, in no particular order.
    pub fn values(&self) -> impl Iterator<Item = &Slot> {
        self.iter().map(|(_, slot)| slot)
    }

    // =========================================================================
    // Per-representation set helpers
    // =========================================================================

    fn set_in_one(&self, entry: &Pair, key: &FlowKey, value: Slot, removing: bool) -> Self {
        if removing {
            if entry.key == *key {
                Self::empty()
            } else {
                self.clone()
            }
        } else if entry.key == *key {
            Self::one(Pair {
                key: entry.key.clone(),
                value,
            })
        } else {
            Self::two(
                entry.clone(),
                Pair {
                    key: key.clone(),
                    value,
                },
            )
        }
    }

    fn set_in_two(
        &self,
        first: &Pair,
        second: &Pair,
        key: &FlowKey,
        value: Slot,
        removing: bool,
    ) -> Self {
        if removing {
            if first.key == *key {
                Self::one(second.clone())
            } else if second.key == *key {
                Self::one(first.clone())
            } else {
                self.clone()
            }
        } else if first.key == *key {
            Self::two(
                Pair {
                    key: first.key.clone(),
                    value,
                },
                second.clone(),
            )
        } else if second.key == *key {
            Self::two(
                first.clone(),
                Pair {
                    key: second.key.clone(),
                    value,
                },
            )
        } else {
            Self::three(
                first.clone(),
                second.clone(),
                Pair {
                    key: key.clone(),
                    value,
                },
            )
        }
    }

    fn set_in_three(
        &self,
        first: &Pair,
        second: &Pair,
        third: &Pair,
        key: &FlowKey,
        value: Slot,
        removing: bool,
    ) -> Self {
        if removing {
            if first.key == *key {
                Self::two(second.clone(), third.clone())
            } else if second.key == *key {
                Self::two(first.clone(), third.clone())
            } else if third.key == *key {
                Self::two(first.clone(), second.clone())
            } else {
                self.clone()
            }
        } else if first.key == *key {
            Self::three(
                Pair {
                    key: first.key.clone(),
                    value,
                },
                second.clone(),
                third.clone(),
            )
        } else if second.key == *key {
            Self::three(
                first.clone(),
                Pair {
                    key: second.key.clone(),
                    value,
                },
                third.clone(),
            )
        } else if third.key == *key {
            Self::three(
                first.clone(),
                second.clone(),
                Pair {
                    key: third.key.clone(),
                    value,
                },
            )
        } else {
            let mut entries = ArrayVec::new();
            entries.push(first.clone());
            entries.push(second.clone());
            entries.push(third.clone());
            entries.push(Pair {
                key: key.clone(),
                value,
            });
            Self::bucket(entries)
        }
    }

    fn set_in_bucket(
        &self,
        entries: &ArrayVec<Pair, BUCKET_CAPACITY>,
        key: &FlowKey,
        value: Slot,
        removing: bool,
    ) -> Self {
        let position = entries.iter().position(|entry| entry.key == *key);

        if removing {
            let Some(index) = position else {
                return self.clone();
            };

            if entries.len() == BUCKET_FLOOR {
                let mut remaining = entries.clone();
                remaining.remove(index);
                let third = remaining.pop().expect("bucket floor leaves three entries");
                let second = remaining.pop().expect("bucket floor leaves three entries");
                let first = remaining.pop().expect("bucket floor leaves three entries");
                Self::three(first, second, third)
            } else {
                let mut smaller = entries.clone();
                smaller.remove(index);
                Self::bucket(smaller)
            }
        } else {
            match position {
                Some(index) => {
                    // Replace keeps the slot's position.
                    let mut replaced = entries.clone();
                    replaced[index].value = value;
                    Self::bucket(replaced)
                }
                None if entries.len() < BUCKET_CAPACITY => {
                    let mut grown = entries.clone();
                    grown.push(Pair {
                        key: key.clone(),
                        value,
                    });
                    Self::bucket(grown)
                }
                None => Self::many_from_bucket(entries, key, value),
            }
        }
    }

    /// Promotes a full bucket plus one new entry into the hash-backed
    /// representation. The table is built privately and only published once
    /// wrapped; no caller can observe it half-filled.
    fn many_from_bucket(
        entries: &ArrayVec<Pair, BUCKET_CAPACITY>,
        key: &FlowKey,
        value: Slot,
    ) -> Self {
        let mut grown =
            FxHashMap::with_capacity_and_hasher(BUCKET_CAPACITY + 1, FxBuildHasher::default());
        for entry in entries {
            grown.insert(entry.key.clone(), entry.value.clone());
        }
        grown.insert(key.clone(), value);
        Self::many(grown)
    }

    fn set_in_many(
        &self,
        entries: &FxHashMap<FlowKey, Slot>,
        key: &FlowKey,
        value: Slot,
        removing: bool,
    ) -> Self {
        if removing {
            if !entries.contains_key(key) {
                return self.clone();
            }

            if entries.len() == BUCKET_CAPACITY + 1 {
                let remaining = entries
                    .iter()
                    .filter(|(stored, _)| *stored != key)
                    .map(|(stored, slot)| Pair {
                        key: stored.clone(),
                        value: slot.clone(),
                    })
                    .collect();
                Self::bucket(remaining)
            } else {
                let mut smaller = FxHashMap::with_capacity_and_hasher(
                    entries.len() - 1,
                    FxBuildHasher::default(),
                );
                for (stored, slot) in entries {
                    if stored != key {
                        smaller.insert(stored.clone(), slot.clone());
                    }
                }
                Self::many(smaller)
            }
        } else {
            let mut written = entries.clone();
            written.insert(key.clone(), value);
            Self::many(written)
        }
    }

    // =========================================================================
    // Representation constructors
    // =========================================================================

    #[inline]
    fn from_inner(inner: FlowMapInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    fn one(entry: Pair) -> Self {
        Self::from_inner(FlowMapInner::One(entry))
    }

    fn two(first: Pair, second: Pair) -> Self {
        debug_assert!(first.key != second.key, "duplicate key in two-entry map");
        Self::from_inner(FlowMapInner::Two { first, second })
    }

    fn three(first: Pair, second: Pair, third: Pair) -> Self {
        debug_assert!(
            first.key != second.key && first.key != third.key && second.key != third.key,
            "duplicate key in three-entry map"
        );
        Self::from_inner(FlowMapInner::Three {
            first,
            second,
            third,
        })
    }

    fn bucket(entries: ArrayVec<Pair, BUCKET_CAPACITY>) -> Self {
        debug_assert!(
            (BUCKET_FLOOR..=BUCKET_CAPACITY).contains(&entries.len()),
            "bucket representation requires {BUCKET_FLOOR}..={BUCKET_CAPACITY} entries"
        );
        Self::from_inner(FlowMapInner::Bucket(entries))
    }

    fn many(entries: FxHashMap<FlowKey, Slot>) -> Self {
        debug_assert!(
            entries.len() > BUCKET_CAPACITY,
            "hash-backed representation requires more than {BUCKET_CAPACITY} entries"
        );
        Self::from_inner(FlowMapInner::Many(entries))
    }
}

// =============================================================================
// Fork helpers
// =============================================================================

fn slot_requires_fork(slot: &Slot) -> bool {
    slot.as_ref()
        .is_some_and(|stored| value::supports_fork_clone(stored.as_ref()))
}

fn forked_slot(slot: &Slot) -> Slot {
    match slot {
        Some(stored) if value::supports_fork_clone(stored.as_ref()) => {
            let clonable = stored
                .as_fork_clone()
                .expect("fork-clone support must be consistent for a concrete value type");
            Some(clonable.fork_clone())
        }
        _ => slot.clone(),
    }
}

fn forked_pair(entry: &Pair) -> Pair {
    Pair {
        key: entry.key.clone(),
        value: forked_slot(&entry.value),
    }
}

// =============================================================================
// Iterator Implementation
// =============================================================================

enum FlowMapIterInner<'a> {
    /// Up to three inline entries; also serves the empty map.
    Fixed {
        entries: [Option<(&'a FlowKey, &'a Slot)>; 3],
        index: usize,
    },
    Bucket(std::slice::Iter<'a, Pair>),
    Many(std::collections::hash_map::Iter<'a, FlowKey, Slot>),
}

/// An iterator over the entries of a [`FlowMap`], in no particular order.
pub struct FlowMapIter<'a> {
    inner: FlowMapIterInner<'a>,
}

impl FlowMapIter<'_> {
    fn remaining(&self) -> usize {
        match &self.inner {
            FlowMapIterInner::Fixed { entries, index } => entries
                .iter()
                .flatten()
                .count()
                .saturating_sub(*index),
            FlowMapIterInner::Bucket(iter) => iter.len(),
            FlowMapIterInner::Many(iter) => iter.len(),
        }
    }
}

impl<'a> Iterator for FlowMapIter<'a> {
    type Item = (&'a FlowKey, &'a Slot);

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            FlowMapIterInner::Fixed { entries, index } => {
                let entry = entries.get(*index).copied().flatten();
                if entry.is_some() {
                    *index += 1;
                }
                entry
            }
            FlowMapIterInner::Bucket(iter) => iter.next().map(|entry| (&entry.key, &entry.value)),
            FlowMapIterInner::Many(iter) => iter.next(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FlowMapIter<'_> {
    fn len(&self) -> usize {
        self.remaining()
    }
}

impl<'a> IntoIterator for &'a FlowMap {
    type Item = (&'a FlowKey, &'a Slot);
    type IntoIter = FlowMapIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// =============================================================================
// Standard Trait Implementations
// =============================================================================

impl Default for FlowMap {
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for FlowMap {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_map().entries(self.iter()).finish()
    }
}

/// Builds a map by folding [`set`](FlowMap::set) under the persisting
/// policy, so explicitly absent slots survive collection.
impl FromIterator<(FlowKey, Slot)> for FlowMap {
    fn from_iter<I: IntoIterator<Item = (FlowKey, Slot)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::empty(), |map, (key, value)| map.set(&key, value, false))
    }
}

static_assertions::assert_impl_all!(FlowMap: Send, Sync, Clone, Default);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{AmbientValue, ForkClone, ValueRef, shared};
    use rstest::rstest;

    fn class_of(map: &FlowMap) -> &'static str {
        match &*map.inner {
            FlowMapInner::Empty => "empty",
            FlowMapInner::One(_) => "one",
            FlowMapInner::Two { .. } => "two",
            FlowMapInner::Three { .. } => "three",
            FlowMapInner::Bucket(_) => "bucket",
            FlowMapInner::Many(_) => "many",
        }
    }

    fn expected_class(count: usize) -> &'static str {
        match count {
            0 => "empty",
            1 => "one",
            2 => "two",
            3 => "three",
            4..=BUCKET_CAPACITY => "bucket",
            _ => "many",
        }
    }

    fn keys(count: usize) -> Vec<FlowKey> {
        (0..count).map(|_| FlowKey::new()).collect()
    }

    fn filled(keys: &[FlowKey]) -> FlowMap {
        keys.iter().enumerate().fold(FlowMap::empty(), |map, (index, key)| {
            map.set(key, Some(shared(index)), true)
        })
    }

    #[rstest]
    fn test_empty_is_the_singleton() {
        let first = FlowMap::empty();
        let second = FlowMap::empty();
        assert!(FlowMap::ptr_eq(&first, &second));
        assert!(first.is_empty());
        assert!(matches!(&*first.inner, FlowMapInner::Empty));
    }

    #[rstest]
    fn test_insert_walks_the_classes_one_at_a_time() {
        let keys = keys(20);
        let mut map = FlowMap::empty();

        for (index, key) in keys.iter().enumerate() {
            map = map.set(key, Some(shared(index)), true);
            let count = index + 1;
            assert_eq!(map.len(), count);
            assert_eq!(class_of(&map), expected_class(count));
        }

        for key in &keys {
            assert!(map.contains_key(key));
        }
    }

    #[rstest]
    fn test_remove_walks_the_classes_back_down() {
        let keys = keys(20);
        let mut map = filled(&keys);

        for (index, key) in keys.iter().enumerate() {
            map = map.set(key, None, true);
            let count = keys.len() - index - 1;
            assert_eq!(map.len(), count);
            assert_eq!(class_of(&map), expected_class(count));
            assert!(!map.contains_key(key));
        }

        assert!(map.is_empty());
        assert!(FlowMap::ptr_eq(&map, &FlowMap::empty()));
    }

    #[rstest]
    #[case::one(1)]
    #[case::two(2)]
    #[case::three(3)]
    #[case::bucket(10)]
    #[case::bucket_full(16)]
    #[case::many(17)]
    fn test_replace_never_changes_class(#[case] count: usize) {
        let keys = keys(count);
        let map = filled(&keys);
        let target = &keys[count / 2];

        let replaced = map.set(target, Some(shared(999_usize)), true);
        assert_eq!(replaced.len(), count);
        assert_eq!(class_of(&replaced), class_of(&map));

        let slot = replaced.get(target).expect("key stays present");
        let stored = slot.as_ref().expect("payload written");
        assert_eq!(stored.downcast_ref::<usize>(), Some(&999));
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::three(3)]
    #[case::bucket(8)]
    #[case::many(18)]
    fn test_removing_absent_key_returns_receiver(#[case] count: usize) {
        let map = filled(&keys(count));
        let stranger = FlowKey::new();

        let same = map.set(&stranger, None, true);
        assert!(FlowMap::ptr_eq(&map, &same));
    }

    #[rstest]
    fn test_bucket_demotes_to_three_at_the_floor() {
        let keys = keys(BUCKET_FLOOR);
        let map = filled(&keys);
        assert_eq!(class_of(&map), "bucket");

        let demoted = map.set(&keys[1], None, true);
        assert_eq!(demoted.len(), 3);
        assert_eq!(class_of(&demoted), "three");
        assert!(!demoted.contains_key(&keys[1]));
        for key in [&keys[0], &keys[2], &keys[3]] {
            assert!(demoted.contains_key(key));
        }
    }

    #[rstest]
    fn test_many_demotes_to_full_bucket() {
        let keys = keys(BUCKET_CAPACITY + 1);
        let map = filled(&keys);
        assert_eq!(class_of(&map), "many");

        let demoted = map.set(&keys[0], None, true);
        assert_eq!(demoted.len(), BUCKET_CAPACITY);
        assert_eq!(class_of(&demoted), "bucket");

        let promoted_again = demoted.set(&keys[0], Some(shared(0_usize)), true);
        assert_eq!(class_of(&promoted_again), "many");
        assert_eq!(promoted_again.len(), BUCKET_CAPACITY + 1);
    }

    #[rstest]
    fn test_bucket_replace_preserves_position() {
        let keys = keys(6);
        let map = filled(&keys);

        let order_before: Vec<FlowKey> = map.keys().cloned().collect();
        let replaced = map.set(&keys[2], Some(shared(777_usize)), true);
        let order_after: Vec<FlowKey> = replaced.keys().cloned().collect();

        assert_eq!(order_before, order_after);
    }

    #[rstest]
    fn test_persisted_absent_slot_is_a_real_entry() {
        let key = FlowKey::new();
        let map = FlowMap::empty().set(&key, None, false);

        assert_eq!(map.len(), 1);
        assert!(map.get(&key).is_some_and(Option::is_none));

        // The removing policy drops it again.
        let dropped = map.set(&key, None, true);
        assert!(dropped.is_empty());
    }

    #[rstest]
    fn test_with_entry_matches_set_on_empty() {
        let key = FlowKey::new();

        let direct = FlowMap::with_entry(&key, Some(shared(4_i32)), true);
        assert_eq!(direct.len(), 1);

        let via_empty = FlowMap::with_entry(&key, None, true);
        assert!(FlowMap::ptr_eq(&via_empty, &FlowMap::empty()));
    }

    // =========================================================================
    // Fork behaviour
    // =========================================================================

    #[derive(Debug)]
    struct Branchable(usize);

    impl AmbientValue for Branchable {
        fn as_fork_clone(&self) -> Option<&dyn ForkClone> {
            Some(self)
        }
    }

    impl ForkClone for Branchable {
        fn fork_clone(&self) -> ValueRef {
            Arc::new(Self(self.0))
        }
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::bucket(7)]
    #[case::many(19)]
    fn test_fork_without_capability_returns_receiver(#[case] count: usize) {
        let map = filled(&keys(count));
        let branch = map.fork();
        assert!(FlowMap::ptr_eq(&map, &branch));
    }

    #[rstest]
    #[case::one(1)]
    #[case::three(3)]
    #[case::bucket(11)]
    #[case::many(18)]
    fn test_fork_copies_capable_values_and_keeps_class(#[case] count: usize) {
        let keys = keys(count);
        let map = keys.iter().enumerate().fold(FlowMap::empty(), |map, (index, key)| {
            map.set(key, Some(shared(Branchable(index))), true)
        });

        let branch = map.fork();
        assert!(!FlowMap::ptr_eq(&map, &branch));
        assert_eq!(branch.len(), count);
        assert_eq!(class_of(&branch), class_of(&map));

        for (index, key) in keys.iter().enumerate() {
            let original = map.get(key).and_then(Option::as_ref).expect("stored");
            let copied = branch.get(key).and_then(Option::as_ref).expect("stored");
            assert!(!Arc::ptr_eq(original, copied));
            assert_eq!(
                copied.downcast_ref::<Branchable>().map(|branched| branched.0),
                Some(index)
            );
        }
    }

    #[rstest]
    fn test_fork_shares_plain_values_in_mixed_map() {
        let plain_key = FlowKey::labeled("plain");
        let branch_key = FlowKey::labeled("branch");

        let map = FlowMap::empty()
            .set(&plain_key, Some(shared(1_u32)), true)
            .set(&branch_key, Some(shared(Branchable(2))), true);

        let branch = map.fork();
        assert!(!FlowMap::ptr_eq(&map, &branch));

        let plain_original = map.get(&plain_key).and_then(Option::as_ref).expect("stored");
        let plain_branch = branch
            .get(&plain_key)
            .and_then(Option::as_ref)
            .expect("stored");
        assert!(Arc::ptr_eq(plain_original, plain_branch));
    }

    #[rstest]
    fn test_fork_shares_persisted_absent_slots() {
        let key = FlowKey::new();
        let map = FlowMap::empty().set(&key, None, false);

        let branch = map.fork();
        assert!(FlowMap::ptr_eq(&map, &branch));
    }

    // =========================================================================
    // Iteration and std traits
    // =========================================================================

    #[rstest]
    #[case(0)]
    #[case(2)]
    #[case(5)]
    #[case(20)]
    fn test_iterator_is_exact_sized(#[case] count: usize) {
        let map = filled(&keys(count));
        let iter = map.iter();
        assert_eq!(iter.len(), count);
        assert_eq!(iter.count(), count);
    }

    #[rstest]
    fn test_from_iterator_keeps_absent_slots() {
        let present = FlowKey::new();
        let pinned = FlowKey::new();

        let map: FlowMap = vec![
            (present.clone(), Some(shared(1_i32))),
            (pinned.clone(), None),
        ]
        .into_iter()
        .collect();

        assert_eq!(map.len(), 2);
        assert!(map.get(&pinned).is_some_and(Option::is_none));
    }

    #[rstest]
    fn test_debug_formats_as_map() {
        let key = FlowKey::labeled("k");
        let map = FlowMap::with_entry(&key, Some(shared(3_i32)), true);
        let rendered = format!("{map:?}");
        assert!(rendered.starts_with('{'));
        assert!(rendered.contains("FlowKey(\"k\")"));
    }

    #[rstest]
    fn test_default_is_empty_singleton() {
        assert!(FlowMap::ptr_eq(&FlowMap::default(), &FlowMap::empty()));
    }
}
