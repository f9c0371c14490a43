//! Lazy, cached derived values.
//!
//! A computed is an effect plus a subscriber dep plus a value cache. The
//! effect's callback recomputes from the getter, compares against the cache,
//! and propagates `Dirty` to subscribers only when the value actually
//! changed; the notification hook propagates `MaybeDirty` lazily, so a chain
//! of computeds re-evaluates only what a downstream read actually pulls.
//!
//! # Example
//! ```ignore
//! let doubled = Computed::new(move || base.get() * 2);
//!
//! let a = doubled.get();  // computes on first read
//! let b = doubled.get();  // cached, getter not called
//! base.set(10);
//! let c = doubled.get();  // recomputes exactly once
//! ```

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use crate::arena::{
    active_effect, create_computed_dep, effect_arena_insert, effect_arena_remove, is_tracking,
    refresh_computed, release_computed_dep, stop_effect, DepId, DirtyLevel, EffectId, EffectSlot,
    Hook,
};
use crate::track::{track_effect, trigger_effects};

/// Memoized derived value that recomputes only when a dependency changed
/// and a read actually pulls it.
pub struct Computed<T> {
    effect_id: EffectId,
    dep_id: DepId,
    value: Arc<RwLock<Option<T>>>,
    setter: Option<Mutex<Box<dyn FnMut(T) + Send>>>,
}

impl<T> Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a computed from a getter. Evaluation is deferred to the first
    /// [`get`](Computed::get).
    pub fn new<F>(mut getter: F) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
    {
        Self::build(move |_| getter(), None, true)
    }

    /// Like [`new`](Computed::new), but the getter receives the previous
    /// cached value.
    pub fn with_prev<F>(getter: F) -> Arc<Self>
    where
        F: FnMut(Option<&T>) -> T + Send + 'static,
    {
        Self::build(getter, None, true)
    }

    /// A writable computed: reads go through the getter, writes through the
    /// setter (which typically pushes back into the sources).
    pub fn writable<F, S>(mut getter: F, setter: S) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
        S: FnMut(T) + Send + 'static,
    {
        Self::build(move |_| getter(), Some(Box::new(setter)), true)
    }

    /// A computed that never trusts its cache: every read re-evaluates.
    pub fn uncached<F>(mut getter: F) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
    {
        Self::build(move |_| getter(), None, false)
    }

    fn build<F>(
        getter: F,
        setter: Option<Box<dyn FnMut(T) + Send>>,
        cacheable: bool,
    ) -> Arc<Self>
    where
        F: FnMut(Option<&T>) -> T + Send + 'static,
    {
        let value: Arc<RwLock<Option<T>>> = Arc::new(RwLock::new(None));

        let mut slot = EffectSlot::new();
        slot.cacheable = cacheable;
        // slot starts Dirty, so the first read computes
        let effect_id = effect_arena_insert(slot);
        let dep_id = create_computed_dep(effect_id);

        // Recompute, compare, store, and propagate Dirty on change. Keeping
        // the comparison inside the callback lets the dirty-resolution walk
        // force a refresh through the untyped effect id.
        let cache = value.clone();
        let mut getter = getter;
        effect_id.install_hook(
            Hook::Fn,
            Box::new(move || {
                let prev = cache.read().clone();
                let next = getter(prev.as_ref());
                let changed = prev.as_ref() != Some(&next);
                *cache.write() = Some(next);
                if changed {
                    cov_mark::hit!(computed_value_changed);
                    trigger_effects(dep_id, DirtyLevel::Dirty);
                }
            }),
        );

        // A notification does not evaluate anything: subscribers are merely
        // marked possibly-stale until one of them reads the value.
        effect_id.install_hook(
            Hook::Notify,
            Box::new(move || {
                let level = if effect_id.dirty_level() == DirtyLevel::MaybeDirtyComputedSideEffect
                {
                    DirtyLevel::MaybeDirtyComputedSideEffect
                } else {
                    DirtyLevel::MaybeDirty
                };
                trigger_effects(dep_id, level);
            }),
        );

        Arc::new(Self {
            effect_id,
            dep_id,
            value,
            setter: setter.map(Mutex::new),
        })
    }

    /// Read the value, re-evaluating if stale and recording the read as a
    /// dependency of the running effect.
    pub fn get(&self) -> T {
        refresh_computed(self.effect_id);
        if is_tracking() {
            if let Some(reader) = active_effect() {
                track_effect(reader, self.dep_id);
            }
        }
        if self.effect_id.dirty_level() >= DirtyLevel::MaybeDirtyComputedSideEffect {
            // the getter has side effects that re-dirtied us; let
            // subscribers know they may need another look
            trigger_effects(self.dep_id, DirtyLevel::MaybeDirtyComputedSideEffect);
        }
        self.value
            .read()
            .clone()
            .expect("computed cache is populated by the refresh above")
    }

    /// Write through the setter. Writing a read-only computed is dropped
    /// (with a warning in debug builds).
    pub fn set(&self, value: T) {
        match &self.setter {
            Some(setter) => (setter.lock().as_mut())(value),
            None => {
                if cfg!(debug_assertions) {
                    log::warn!("write to a read-only computed was ignored");
                }
            }
        }
    }

    #[allow(dead_code)]
    pub(crate) fn effect_id(&self) -> EffectId {
        self.effect_id
    }
}

impl<T> Drop for Computed<T> {
    fn drop(&mut self) {
        stop_effect(self.effect_id);
        effect_arena_remove(self.effect_id);
        // subscribers still holding this dep id prune it on their next run
        release_computed_dep(self.dep_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Key, TargetKind};
    use crate::track::{track, trigger, Target, TrackOp, TriggerOp};
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Cell {
        target: Target,
        value: AtomicI64,
    }

    impl Cell {
        fn new(v: i64) -> Arc<Self> {
            Arc::new(Self {
                target: Target::new(TargetKind::Plain),
                value: AtomicI64::new(v),
            })
        }

        fn get(&self) -> i64 {
            track(self.target.id(), TrackOp::Get, Key::prop("value"));
            self.value.load(Ordering::Relaxed)
        }

        fn set(&self, v: i64) {
            self.value.store(v, Ordering::Relaxed);
            trigger(self.target.id(), TriggerOp::Set, Some(Key::prop("value")), None);
        }
    }

    #[test]
    fn first_read_computes_then_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let computed = Computed::new(move || {
            calls_in.fetch_add(1, Ordering::Relaxed);
            7
        });

        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(computed.get(), 7);
        assert_eq!(computed.get(), 7);
        assert_eq!(computed.get(), 7);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn recomputes_after_source_change() {
        let x = Cell::new(1);
        let calls = Arc::new(AtomicUsize::new(0));

        let x_in = x.clone();
        let calls_in = calls.clone();
        let doubled = Computed::new(move || {
            calls_in.fetch_add(1, Ordering::Relaxed);
            x_in.get() * 2
        });

        assert_eq!(doubled.get(), 2);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        x.set(5);
        // the write only marked subscribers; nothing evaluated yet
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        assert_eq!(doubled.get(), 10);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn unchanged_value_does_not_dirty_subscribers() {
        let x = Cell::new(4);
        let getter_calls = Arc::new(AtomicUsize::new(0));

        let x_in = x.clone();
        let calls_in = getter_calls.clone();
        // collapses many inputs to the same output
        let parity = Computed::new(move || {
            calls_in.fetch_add(1, Ordering::Relaxed);
            x_in.get() % 2
        });

        let downstream_calls = Arc::new(AtomicUsize::new(0));
        let parity_in = parity.clone();
        let down_in = downstream_calls.clone();
        let downstream = Computed::new(move || {
            down_in.fetch_add(1, Ordering::Relaxed);
            parity_in.get() + 10
        });

        assert_eq!(downstream.get(), 10);
        assert_eq!(downstream_calls.load(Ordering::Relaxed), 1);

        // 4 -> 6 keeps parity 0: parity recomputes, downstream must not
        x.set(6);
        assert_eq!(downstream.get(), 10);
        assert_eq!(getter_calls.load(Ordering::Relaxed), 2);
        assert_eq!(downstream_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn writable_computed_pushes_through_setter() {
        let source = Cell::new(10);

        let read_source = source.clone();
        let write_source = source.clone();
        let mirrored = Computed::writable(
            move || read_source.get(),
            move |v| write_source.set(v),
        );

        assert_eq!(mirrored.get(), 10);
        mirrored.set(42);
        assert_eq!(source.get(), 42);
        assert_eq!(mirrored.get(), 42);
    }

    #[test]
    fn read_only_write_is_dropped() {
        let computed = Computed::new(|| 1);
        computed.set(99);
        assert_eq!(computed.get(), 1);
    }

    #[test]
    fn uncached_reevaluates_every_read() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let eager = Computed::uncached(move || calls_in.fetch_add(1, Ordering::Relaxed));

        assert_eq!(eager.get(), 0);
        assert_eq!(eager.get(), 1);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn with_prev_sees_last_value() {
        let x = Cell::new(1);
        let x_in = x.clone();
        let running_max = Computed::with_prev(move |prev| {
            let current = x_in.get();
            prev.copied().unwrap_or(i64::MIN).max(current)
        });

        assert_eq!(running_max.get(), 1);
        x.set(5);
        assert_eq!(running_max.get(), 5);
        x.set(3);
        assert_eq!(running_max.get(), 5);
    }
}
