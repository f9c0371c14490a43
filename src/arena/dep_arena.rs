// Dep arena - storage for dependency sets and the target map.
//
// A dep is the set of effects subscribed to one reactive slot: either a
// (target, key) pair in the target map, or the subscriber set of a computed.
// Subscribers are an ordered map effect -> trackId snapshot; an edge counts
// as current when its snapshot equals the effect's live trackId.
//
// TARGET MAP:
// - register_target allocates a stable id for one reactive object
// - TargetId -> { kind, key -> DepId }
// - a key-owned dep that loses its last subscriber removes itself from the
//   key map in the same call (exactly once)
// - deregistration replaces the weak-reference lifetime of the original
//   design: dropping a Target destroys its entry and deps

use papaya::HashMap as PapayaHashMap;
use parking_lot::RwLock;
use slab::Slab;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use crate::hash::{FastIndexMap, FastMap};

use super::effect_arena::EffectId;

/// Global dep arena - stores all dependency sets.
static DEP_ARENA: RwLock<Slab<DepSlot>> = RwLock::new(Slab::new());

/// Global target map: one entry per registered reactive object.
static TARGET_MAP: LazyLock<PapayaHashMap<TargetId, TargetEntry>> =
    LazyLock::new(PapayaHashMap::new);

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of one reactive object, allocated by [`register_target`].
///
/// Ids are never reused, so a deregistered target cannot be resurrected by
/// a late track call.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TargetId(u64);

/// Shape of a reactive object, consulted by trigger's collection rules.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TargetKind {
    /// Plain keyed object.
    Plain,
    /// Indexed list with a length slot.
    List,
    /// Keyed collection with distinct key iteration.
    Map,
    /// Value collection.
    Set,
}

/// Property key of a reactive slot.
///
/// `Iterate` and `MapKeyIterate` are the reserved keys recording
/// collection-iteration reads, distinct from any per-key dependency.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    /// Named property (string or symbol name).
    Prop(String),
    /// Integer index into a list.
    Index(u64),
    /// A list's length slot.
    Length,
    /// Collection iteration.
    Iterate,
    /// Map key iteration.
    MapKeyIterate,
}

impl Key {
    /// Named-property key.
    pub fn prop(name: impl Into<String>) -> Self {
        Key::Prop(name.into())
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Prop(name.to_owned())
    }
}

impl From<u64> for Key {
    fn from(index: u64) -> Self {
        Key::Index(index)
    }
}

pub(crate) struct TargetEntry {
    pub(crate) kind: TargetKind,
    pub(crate) keys: RwLock<FastMap<Key, DepId>>,
}

impl TargetEntry {
    fn new(kind: TargetKind) -> Self {
        Self {
            kind,
            keys: RwLock::new(FastMap::default()),
        }
    }
}

/// Register a reactive object and allocate its stable id.
pub fn register_target(kind: TargetKind) -> TargetId {
    let id = TargetId(NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed));
    TARGET_MAP.pin().insert(id, TargetEntry::new(kind));
    id
}

/// Deregister a reactive object, destroying its entry and every dep under
/// it. Effects that still reference those deps prune the stale ids on their
/// next run.
pub fn deregister_target(target: TargetId) {
    let guard = TARGET_MAP.pin();
    if let Some(entry) = guard.get(&target) {
        let deps: SmallVec<[DepId; 8]> = entry.keys.write().drain().map(|(_, dep)| dep).collect();
        let mut arena = DEP_ARENA.write();
        for dep in deps {
            arena.try_remove(dep.index());
        }
    }
    guard.remove(&target);
}

/// Run a closure against a target's entry. Returns None for unregistered
/// (or already deregistered) targets.
pub(crate) fn with_target_entry<F, R>(target: TargetId, f: F) -> Option<R>
where
    F: FnOnce(&TargetEntry) -> R,
{
    let guard = TARGET_MAP.pin();
    guard.get(&target).map(f)
}

/// Look up the dep for `(target, key)`, creating it on first track.
///
/// Returns None when the target was never registered - reads of unknown
/// targets record nothing.
pub(crate) fn target_dep_or_insert(target: TargetId, key: &Key) -> Option<DepId> {
    with_target_entry(target, |entry| {
        if let Some(&dep) = entry.keys.read().get(key) {
            return dep;
        }
        *entry
            .keys
            .write()
            .entry(key.clone())
            .or_insert_with(|| dep_arena_insert(DepSlot::for_key(target, key.clone())))
    })
}

/// What a dep belongs to; decides its cleanup behavior when emptied.
pub(crate) enum DepOwner {
    /// A slot in the target map: removed from its key map on empty.
    Key { target: TargetId, key: Key },
    /// A computed's subscriber set: lives exactly as long as its owner.
    Computed(EffectId),
}

/// One dependency set stored in the arena.
pub(crate) struct DepSlot {
    /// Ordered mapping effect -> trackId snapshot at edge-record time.
    pub(crate) subscribers: RwLock<FastIndexMap<EffectId, u64>>,
    pub(crate) owner: DepOwner,
}

impl DepSlot {
    pub(crate) fn for_key(target: TargetId, key: Key) -> Self {
        Self {
            subscribers: RwLock::new(FastIndexMap::default()),
            owner: DepOwner::Key { target, key },
        }
    }
}

/// Unique identifier for a dep in the arena.
///
/// Stale access (after the dep self-destructed or its owner dropped)
/// returns None or an inert default.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct DepId(u32);

impl DepId {
    fn new(index: u32) -> Self {
        Self(index)
    }

    fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&DepSlot) -> R,
    {
        let arena = DEP_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// The trackId snapshot recorded for `effect`, if subscribed.
    pub(crate) fn edge(self, effect: EffectId) -> Option<u64> {
        self.with(|slot| slot.subscribers.read().get(&effect).copied())
            .flatten()
    }

    /// Record (or refresh) the edge for `effect` at `track_id`.
    pub(crate) fn record_edge(self, effect: EffectId, track_id: u64) {
        self.with(|slot| {
            slot.subscribers.write().insert(effect, track_id);
        });
    }

    /// Snapshot of `(effect, trackId)` edges in subscription order.
    pub(crate) fn snapshot_edges(self) -> SmallVec<[(EffectId, u64); 8]> {
        self.with(|slot| {
            slot.subscribers
                .read()
                .iter()
                .map(|(&effect, &tid)| (effect, tid))
                .collect()
        })
        .unwrap_or_default()
    }

    /// The computed that owns this dep, if any.
    pub(crate) fn computed_owner(self) -> Option<EffectId> {
        self.with(|slot| match slot.owner {
            DepOwner::Computed(owner) => Some(owner),
            DepOwner::Key { .. } => None,
        })
        .flatten()
    }

    pub(crate) fn subscriber_count(self) -> usize {
        self.with(|slot| slot.subscribers.read().len())
            .unwrap_or(0)
    }
}

fn dep_arena_insert(slot: DepSlot) -> DepId {
    let mut arena = DEP_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(slot);
    DepId::new(key as u32)
}

/// Allocate the subscriber dep of a computed.
pub(crate) fn create_computed_dep(owner: EffectId) -> DepId {
    dep_arena_insert(DepSlot {
        subscribers: RwLock::new(FastIndexMap::default()),
        owner: DepOwner::Computed(owner),
    })
}

/// Destroy a computed's dep when the computed itself is dropped.
pub(crate) fn release_computed_dep(dep: DepId) {
    DEP_ARENA.write().try_remove(dep.index());
}

/// Remove the edge `dep -> effect` unless it was re-recorded in the
/// effect's current run, releasing the dep if it becomes empty.
pub(crate) fn cleanup_dep_edge(dep: DepId, effect: EffectId, current_track_id: u64) {
    let became_empty = dep
        .with(|slot| {
            let mut subs = slot.subscribers.write();
            match subs.get(&effect) {
                Some(&tid) if tid != current_track_id => {
                    subs.shift_remove(&effect);
                    subs.is_empty()
                }
                _ => false,
            }
        })
        .unwrap_or(false);
    if became_empty {
        release_empty_dep(dep);
    }
}

/// Self-cleanup of an emptied key-owned dep: drop its arena slot and its
/// key-map entry exactly once. Computed-owned deps are left alone.
fn release_empty_dep(dep: DepId) {
    let removed = {
        let mut arena = DEP_ARENA.write();
        let is_empty_key_dep = arena.get(dep.index()).is_some_and(|slot| {
            matches!(slot.owner, DepOwner::Key { .. }) && slot.subscribers.read().is_empty()
        });
        if is_empty_key_dep {
            arena.try_remove(dep.index())
        } else {
            None
        }
    };
    let Some(slot) = removed else { return };
    cov_mark::hit!(empty_dep_released);
    if let DepOwner::Key { target, key } = slot.owner {
        let guard = TARGET_MAP.pin();
        if let Some(entry) = guard.get(&target) {
            entry.keys.write().remove(&key);
        }
    }
}
