//! Public effect API: rerunnable computations with automatic dependency
//! re-collection.
//!
//! # How effects work
//! 1. Create with a function that reads reactive state
//! 2. The effect runs immediately (unless lazy), recording every read as an
//!    edge in the dependency graph
//! 3. A write to any recorded dependency notifies the effect
//! 4. By default the notification re-runs the effect synchronously once the
//!    outermost trigger settles; a scheduler override defers it instead
//! 5. Each run re-collects dependencies from scratch, so conditional reads
//!    drop the edges a branch no longer takes
//!
//! # Example
//! ```ignore
//! let runner = effect(move || {
//!     println!("total: {}", cart.subtotal() + cart.shipping());
//! });
//!
//! cart.set_shipping(0.0);  // effect re-runs once the trigger settles
//! runner.stop();           // never re-runs again
//! ```

use crate::arena::{
    effect_arena_insert, effect_arena_remove, resolve_dirty, run_effect, stop_effect, EffectId,
    EffectSlot, Hook,
};

/// Construction knobs for [`effect_with_options`].
#[derive(Default)]
pub struct EffectOptions {
    /// Skip the initial run; the caller runs the effect when ready.
    pub lazy: bool,
    /// Let notifications enqueue this effect while it is itself running.
    pub allow_recurse: bool,
    /// Replace the default notify behavior (synchronous re-run when dirty)
    /// with a deferred handoff, e.g. pushing a job onto the tick queue.
    ///
    /// A scheduler that outlives its queue entries must deactivate them
    /// before the runner is dropped, or a queued entry may observe a reused
    /// effect slot.
    pub scheduler: Option<Box<dyn FnMut() + Send>>,
    /// Invoked once when the effect is stopped.
    pub on_stop: Option<Box<dyn FnOnce() + Send>>,
}

/// Owning handle for a reactive effect.
///
/// Dropping the runner stops the effect and frees its slot.
pub struct ReactiveEffect {
    id: EffectId,
}

impl ReactiveEffect {
    /// Re-run the computation now, re-collecting dependencies.
    pub fn run(&self) {
        run_effect(self.id);
    }

    /// Stop the effect: every dep drops it and it will never re-run.
    pub fn stop(&self) {
        stop_effect(self.id);
    }

    /// Whether the last result is stale, resolving MaybeDirty levels.
    pub fn dirty(&self) -> bool {
        resolve_dirty(self.id)
    }

    pub(crate) fn id(&self) -> EffectId {
        self.id
    }
}

impl Drop for ReactiveEffect {
    fn drop(&mut self) {
        stop_effect(self.id);
        effect_arena_remove(self.id);
    }
}

/// Create an effect that runs immediately and re-runs when its recorded
/// dependencies change.
pub fn effect<F>(f: F) -> ReactiveEffect
where
    F: FnMut() + Send + 'static,
{
    effect_with_options(f, EffectOptions::default())
}

/// Create an effect with explicit options.
pub fn effect_with_options<F>(f: F, options: EffectOptions) -> ReactiveEffect
where
    F: FnMut() + Send + 'static,
{
    let mut slot = EffectSlot::new();
    slot.allow_recurse = options.allow_recurse;
    *slot.callback.get_mut() = Some(Box::new(f));
    *slot.on_stop.get_mut() = options.on_stop;
    let id = effect_arena_insert(slot);

    let scheduler: Box<dyn FnMut() + Send> = match options.scheduler {
        Some(scheduler) => scheduler,
        // the plain-effect default: once notifications settle, re-run
        // synchronously if anything actually changed
        None => Box::new(move || {
            if resolve_dirty(id) {
                run_effect(id);
            }
        }),
    };
    id.install_hook(Hook::Scheduler, scheduler);

    if !options.lazy {
        run_effect(id);
    }
    ReactiveEffect { id }
}

/// Stop a runner (free-function mirror of [`ReactiveEffect::stop`]).
pub fn stop(runner: &ReactiveEffect) {
    runner.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Key, TargetKind};
    use crate::track::{track, trigger, Target, TrackOp, TriggerOp};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn lazy_effect_waits_for_first_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        let runner = effect_with_options(
            move || {
                runs_in.fetch_add(1, Ordering::Relaxed);
            },
            EffectOptions {
                lazy: true,
                ..Default::default()
            },
        );

        assert_eq!(runs.load(Ordering::Relaxed), 0);
        runner.run();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stopped_effect_never_reruns() {
        let target = Target::new(TargetKind::Plain);
        let id = target.id();
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in = runs.clone();
        let runner = effect(move || {
            track(id, TrackOp::Get, Key::prop("v"));
            runs_in.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        runner.stop();
        trigger(id, TriggerOp::Set, Some(Key::prop("v")), None);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn on_stop_runs_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let stops_in = stops.clone();
        let runner = effect_with_options(
            || {},
            EffectOptions {
                on_stop: Some(Box::new(move || {
                    stops_in.fetch_add(1, Ordering::Relaxed);
                })),
                ..Default::default()
            },
        );

        runner.stop();
        runner.stop();
        assert_eq!(stops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn nested_effects_collect_separately() {
        let target = Target::new(TargetKind::Plain);
        let id = target.id();
        let outer_runs = Arc::new(AtomicUsize::new(0));
        let inner_runs = Arc::new(AtomicUsize::new(0));

        let outer_in = outer_runs.clone();
        let inner_counter = inner_runs.clone();
        let outer = effect(move || {
            track(id, TrackOp::Get, Key::prop("outer"));
            outer_in.fetch_add(1, Ordering::Relaxed);
            // the inner effect collects its own deps without polluting ours
            let inner_in = inner_counter.clone();
            let inner = effect(move || {
                track(id, TrackOp::Get, Key::prop("inner"));
                inner_in.fetch_add(1, Ordering::Relaxed);
            });
            drop(inner);
        });

        assert_eq!(outer_runs.load(Ordering::Relaxed), 1);
        assert_eq!(inner_runs.load(Ordering::Relaxed), 1);

        // only the outer key re-runs the outer effect
        trigger(id, TriggerOp::Set, Some(Key::prop("outer")), None);
        assert_eq!(outer_runs.load(Ordering::Relaxed), 2);
        drop(outer);
    }
}
