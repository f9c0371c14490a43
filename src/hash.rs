//! Fixed-seed hashing for the internal graph collections.
//!
//! Every map and set in the engine is keyed by small copyable ids
//! (`EffectId`, `DepId`, `TargetId`) or by property keys, none of which are
//! attacker-controlled, so HashDoS resistance buys nothing here. A zero-sized
//! `BuildHasher` over foldhash keeps the per-collection overhead at zero and
//! makes iteration order reproducible across runs.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};

/// Zero-sized `BuildHasher` using foldhash with a fixed seed.
///
/// All instances hash identically, so collections built with it can be
/// compared and merged without rehashing surprises.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x6fe2_e6d7_8b54_a4c5).build_hasher()
    }
}

/// `HashMap` keyed with [`FastHashBuilder`].
pub type FastMap<K, V> = std::collections::HashMap<K, V, FastHashBuilder>;

/// `IndexMap` keyed with [`FastHashBuilder`].
pub type FastIndexMap<K, V> = indexmap::IndexMap<K, V, FastHashBuilder>;
