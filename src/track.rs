//! The two primitives that read and write the dependency graph.
//!
//! A reactive proxy layer (external to this crate) calls [`track`] on every
//! observable read and [`trigger`] on every observable write. Track records
//! an edge between the running effect and the dep for `(target, key)`;
//! trigger walks the deps a write invalidates and notifies their effects.
//!
//! # Usage
//!
//! ```ignore
//! struct Cell { value: f64, target: Target }
//!
//! impl Cell {
//!     fn get(&self) -> f64 {
//!         track(self.target.id(), TrackOp::Get, Key::prop("value"));
//!         self.value
//!     }
//!     fn set(&mut self, v: f64) {
//!         self.value = v;
//!         trigger(self.target.id(), TriggerOp::Set, Some(Key::prop("value")), None);
//!     }
//! }
//! ```

use smallvec::SmallVec;

use crate::arena::{
    active_effect, cleanup_dep_edge, deregister_target, is_tracking, pause_scheduling,
    queue_effect_scheduler, register_target, reset_scheduling, target_dep_or_insert,
    with_target_entry, DepId, DirtyLevel, EffectId, Key, TargetId, TargetKind,
};

/// Kind of observable read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrackOp {
    /// Property access.
    Get,
    /// Existence check.
    Has,
    /// Collection iteration.
    Iterate,
}

/// Kind of observable write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TriggerOp {
    /// Existing slot overwritten.
    Set,
    /// New slot created.
    Add,
    /// Slot removed.
    Delete,
    /// Whole collection cleared.
    Clear,
}

/// RAII registration of one reactive object in the target map.
///
/// The wrapper that intercepts reads and writes owns a `Target` and passes
/// its id to [`track`]/[`trigger`]. Dropping it deregisters the object and
/// destroys its deps.
///
/// Intentionally not Clone: the target map entry is deregistered on drop,
/// so two owners would double-free it. Share the `TargetId` instead.
#[derive(Debug)]
pub struct Target {
    id: TargetId,
}

impl Target {
    /// Register a reactive object of the given shape.
    pub fn new(kind: TargetKind) -> Self {
        Self {
            id: register_target(kind),
        }
    }

    /// The stable id to pass to [`track`] and [`trigger`].
    pub fn id(&self) -> TargetId {
        self.id
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        deregister_target(self.id);
    }
}

/// Record a read of `(target, key)` as a dependency of the running effect.
///
/// Does nothing when tracking is paused, no effect is running, or the
/// target was never registered.
pub fn track(target: TargetId, op: TrackOp, key: Key) {
    if !is_tracking() {
        return;
    }
    let Some(effect) = active_effect() else { return };
    log::trace!("track {op:?} {key:?} on {target:?}");
    let Some(dep) = target_dep_or_insert(target, &key) else {
        return;
    };
    track_effect(effect, dep);
}

/// Record the edge `effect <-> dep` with positional dep-slot reuse.
///
/// Repeated reads of the same slot within one run dedup through the trackId
/// snapshot. When the cursor slot held a different dep from the previous
/// run, that edge is removed unless re-recorded elsewhere this run.
pub(crate) fn track_effect(effect: EffectId, dep: DepId) {
    let track_id = effect.track_id();
    if dep.edge(effect) == Some(track_id) {
        cov_mark::hit!(edge_already_current);
        return;
    }
    dep.record_edge(effect, track_id);
    if let Some(old) = effect.commit_dep_slot(dep) {
        cov_mark::hit!(cursor_slot_replaced);
        cleanup_dep_edge(old, effect, track_id);
    }
    #[cfg(debug_assertions)]
    effect.call_debug_tap(false);
}

/// Notify everything a write of `(target, key)` invalidates.
///
/// `new_len` carries the new length for `Key::Length` writes on list
/// targets, which additionally invalidate every index at or past it. The
/// collected deps are notified under one scheduling pause, so their
/// schedulers run as a single batch when the outermost trigger resumes.
pub fn trigger(target: TargetId, op: TriggerOp, key: Option<Key>, new_len: Option<u64>) {
    log::trace!("trigger {op:?} {key:?} on {target:?}");
    let Some(deps) = with_target_entry(target, |entry| {
        collect_triggered_deps(entry.kind, &entry.keys.read(), op, &key, new_len)
    }) else {
        return;
    };

    pause_scheduling();
    for dep in deps {
        trigger_effects(dep, DirtyLevel::Dirty);
    }
    reset_scheduling();
}

fn collect_triggered_deps(
    kind: TargetKind,
    keys: &crate::hash::FastMap<Key, DepId>,
    op: TriggerOp,
    key: &Option<Key>,
    new_len: Option<u64>,
) -> SmallVec<[DepId; 8]> {
    let mut deps = SmallVec::new();
    let mut push_key = |key: &Key, deps: &mut SmallVec<[DepId; 8]>| {
        if let Some(&dep) = keys.get(key) {
            deps.push(dep);
        }
    };

    if op == TriggerOp::Clear {
        // every slot of the collection is invalidated
        deps.extend(keys.values().copied());
        return deps;
    }

    if kind == TargetKind::List && *key == Some(Key::Length) {
        // shrinking a list invalidates the length slot and every index at
        // or past the new length
        let new_len = new_len.unwrap_or(0);
        for (k, &dep) in keys.iter() {
            match *k {
                Key::Length => deps.push(dep),
                Key::Index(i) if i >= new_len => deps.push(dep),
                _ => {}
            }
        }
        return deps;
    }

    if let Some(k) = key {
        push_key(k, &mut deps);
    }
    match op {
        TriggerOp::Add => {
            if kind != TargetKind::List {
                push_key(&Key::Iterate, &mut deps);
                if kind == TargetKind::Map {
                    push_key(&Key::MapKeyIterate, &mut deps);
                }
            } else if matches!(key, Some(Key::Index(_))) {
                // a new index makes the list longer
                push_key(&Key::Length, &mut deps);
            }
        }
        TriggerOp::Delete => {
            if kind != TargetKind::List {
                push_key(&Key::Iterate, &mut deps);
                if kind == TargetKind::Map {
                    push_key(&Key::MapKeyIterate, &mut deps);
                }
            }
        }
        TriggerOp::Set => {
            if kind == TargetKind::Map {
                push_key(&Key::Iterate, &mut deps);
            }
        }
        TriggerOp::Clear => {}
    }
    deps
}

/// Notify every current subscriber of `dep` at the given dirty level.
///
/// For each effect whose edge is still current: upgrade its dirty level,
/// latch `should_schedule` on the NotDirty transition, invoke its trigger
/// hook, and - unless it is mid-run without `allow_recurse`, or parked at
/// the computed-side-effect level - clear the latch and enqueue its
/// scheduler. Schedulers collected here run when the outermost scheduling
/// pause resumes.
pub(crate) fn trigger_effects(dep: DepId, level: DirtyLevel) {
    pause_scheduling();
    for (effect, edge_track_id) in dep.snapshot_edges() {
        let Some(current) = effect.live_track_id() else {
            continue;
        };
        let tracking = edge_track_id == current;
        if tracking && effect.dirty_level() < level {
            if effect.dirty_level() == DirtyLevel::NotDirty {
                effect.set_should_schedule(true);
            }
            effect.set_dirty_level(level);
        }
        if tracking && effect.should_schedule() {
            effect.call_hook(crate::arena::Hook::Notify);
            #[cfg(debug_assertions)]
            effect.call_debug_tap(true);
            if (effect.runnings() == 0 || effect.allow_recurse())
                && effect.dirty_level() != DirtyLevel::MaybeDirtyComputedSideEffect
            {
                effect.set_should_schedule(false);
                if effect.has_scheduler() {
                    cov_mark::hit!(scheduler_enqueued);
                    queue_effect_scheduler(effect);
                }
            }
        }
    }
    reset_scheduling();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::effect;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn repeated_reads_record_one_edge() {
        cov_mark::check!(edge_already_current);

        let target = Target::new(TargetKind::Plain);
        let id = target.id();
        let runner = effect(move || {
            track(id, TrackOp::Get, Key::prop("x"));
            track(id, TrackOp::Get, Key::prop("x"));
            track(id, TrackOp::Get, Key::prop("x"));
        });

        let dep = target_dep_or_insert(id, &Key::prop("x")).unwrap();
        assert_eq!(dep.subscriber_count(), 1);
        drop(runner);
    }

    #[test]
    fn untracked_reads_record_nothing() {
        let target = Target::new(TargetKind::Plain);
        let id = target.id();
        let runner = effect(move || {
            crate::arena::untracked(|| {
                track(id, TrackOp::Get, Key::prop("silent"));
            });
        });

        let dep = target_dep_or_insert(id, &Key::prop("silent")).unwrap();
        assert_eq!(dep.subscriber_count(), 0);
        drop(runner);
    }

    #[test]
    fn clear_notifies_every_key() {
        let target = Target::new(TargetKind::Map);
        let id = target.id();
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in = runs.clone();
        let runner = effect(move || {
            track(id, TrackOp::Get, Key::prop("a"));
            track(id, TrackOp::Get, Key::prop("b"));
            runs_in.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        trigger(id, TriggerOp::Clear, None, None);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        drop(runner);
    }

    #[test]
    fn list_length_shrink_hits_truncated_indices() {
        let target = Target::new(TargetKind::List);
        let id = target.id();
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in = runs.clone();
        let runner = effect(move || {
            track(id, TrackOp::Get, Key::Index(5));
            runs_in.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        // shrink to 6 elements: index 5 survives
        trigger(id, TriggerOp::Set, Some(Key::Length), Some(6));
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        // shrink to 3 elements: index 5 is truncated away
        trigger(id, TriggerOp::Set, Some(Key::Length), Some(3));
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        drop(runner);
    }

    #[test]
    fn add_on_map_notifies_iteration_deps() {
        let target = Target::new(TargetKind::Map);
        let id = target.id();
        let iterations = Arc::new(AtomicUsize::new(0));

        let iterations_in = iterations.clone();
        let runner = effect(move || {
            track(id, TrackOp::Iterate, Key::Iterate);
            track(id, TrackOp::Iterate, Key::MapKeyIterate);
            iterations_in.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(iterations.load(Ordering::Relaxed), 1);

        trigger(id, TriggerOp::Add, Some(Key::prop("new-entry")), None);
        assert_eq!(iterations.load(Ordering::Relaxed), 2);

        // overwriting an existing entry re-notifies map iteration
        trigger(id, TriggerOp::Set, Some(Key::prop("new-entry")), None);
        assert_eq!(iterations.load(Ordering::Relaxed), 3);
        drop(runner);
    }

    #[test]
    fn add_on_list_index_notifies_length() {
        let target = Target::new(TargetKind::List);
        let id = target.id();
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in = runs.clone();
        let runner = effect(move || {
            track(id, TrackOp::Get, Key::Length);
            runs_in.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        trigger(id, TriggerOp::Add, Some(Key::Index(0)), None);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        drop(runner);
    }
}
