//! Watchers: a getter, a callback, and a scheduling policy.
//!
//! [`watch`] turns a tracked getter into an effect whose notifications run a
//! user callback with the new and previous values. The `flush` option picks
//! when the callback runs relative to the tick: `Pre` (default) queues a
//! pre-flagged job, `Post` queues a post-flush callback, `Sync` runs inline
//! once the triggering write settles.
//!
//! # Example
//! ```ignore
//! let handle = watch(
//!     move || cart.total(),
//!     |total, previous, on_cleanup| {
//!         let request = begin_quote(*total);
//!         on_cleanup.set(move || request.abort());
//!     },
//!     WatchOptions { immediate: true, ..Default::default() },
//! );
//!
//! cart.add_item(item);
//! next_tick(); // pre watchers run here
//! handle.stop();
//! ```
//!
//! Multi-source watching is a getter returning a tuple; element-wise
//! `PartialEq` gives any-changed semantics.

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

use crate::arena::{
    effect_arena_insert, effect_arena_remove, resolve_dirty, run_effect, stop_effect, EffectSlot,
    Hook,
};
use crate::error::{call_with_error_handling, ErrorCode};
use crate::scheduler::{invalidate_job, queue_job, queue_post_flush_cb, InstanceId, Job, JobOptions};
use crate::traverse::{traverse, Traverse};

/// When a watcher's callback runs relative to the tick.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Flush {
    /// Before the main jobs of its id (the default).
    #[default]
    Pre,
    /// In the post-flush phase.
    Post,
    /// Inline, as soon as the triggering write settles.
    Sync,
}

/// Options for [`watch`].
#[derive(Default)]
pub struct WatchOptions {
    /// Run the callback once at setup, with no previous value.
    pub immediate: bool,
    /// Traverse the getter's result so nested reactive reads are tracked;
    /// the callback then fires on every notification (deep values are not
    /// compared).
    pub deep: bool,
    /// Scheduling phase.
    pub flush: Flush,
    /// Stop the watcher after the first callback.
    pub once: bool,
    /// Owning component instance: orders the pre job and attributes errors.
    pub instance: Option<InstanceId>,
    /// Debug tap invoked whenever the watcher records a dependency edge.
    #[cfg(debug_assertions)]
    pub on_track: Option<Box<dyn FnMut() + Send>>,
    /// Debug tap invoked whenever the watcher is notified.
    #[cfg(debug_assertions)]
    pub on_trigger: Option<Box<dyn FnMut() + Send>>,
}

/// Registers the cleanup to run before the next callback (and on stop).
///
/// Setting a new cleanup replaces an unconsumed one.
#[derive(Clone, Default)]
pub struct OnCleanup {
    slot: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl OnCleanup {
    /// Register the cleanup closure.
    pub fn set<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.slot.lock() = Some(Box::new(f));
    }

    fn take(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.slot.lock().take()
    }
}

/// Owning stop handle for a watcher. Dropping it stops the watcher.
pub struct WatchHandle {
    effect: crate::arena::EffectId,
    job: Job,
    cleanup: OnCleanup,
    instance: Option<InstanceId>,
}

impl WatchHandle {
    /// Stop the watcher: pending jobs become no-ops, the registered cleanup
    /// runs, and the effect drops out of every dep.
    pub fn stop(&self) {
        self.job.deactivate();
        invalidate_job(&self.job);
        if let Some(cleanup) = self.cleanup.take() {
            call_with_error_handling(cleanup, ErrorCode::WatchCleanup, self.instance);
        }
        stop_effect(self.effect);
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
        effect_arena_remove(self.effect);
    }
}

/// Watch a tracked getter and invoke `callback(new, old, on_cleanup)` when
/// its result changes.
///
/// Without `immediate`, the getter runs once at setup to seed dependencies
/// and the previous value; the first callback then carries that value as
/// `old`. With `immediate`, the callback also runs at setup with `old =
/// None`.
pub fn watch<T, G, C>(getter: G, callback: C, options: WatchOptions) -> WatchHandle
where
    T: Traverse + Clone + PartialEq + Send + 'static,
    G: FnMut() -> T + Send + 'static,
    C: FnMut(&T, Option<&T>, &OnCleanup) + Send + 'static,
{
    let WatchOptions {
        immediate,
        deep,
        flush,
        once,
        instance,
        #[cfg(debug_assertions)]
        on_track,
        #[cfg(debug_assertions)]
        on_trigger,
    } = options;

    let latest: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
    let old: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
    let cleanup = OnCleanup::default();

    let id = effect_arena_insert(EffectSlot::new());
    #[cfg(debug_assertions)]
    id.install_debug_taps(on_track, on_trigger);

    // the tracked source read; deep watchers also traverse the result so
    // nested reactive reads land in the dep list
    let mut getter = getter;
    let latest_in = latest.clone();
    id.install_hook(
        Hook::Fn,
        Box::new(move || {
            let value = getter();
            if deep {
                traverse(&value, None);
            }
            *latest_in.lock() = Some(value);
        }),
    );

    let self_job: Arc<OnceLock<Job>> = Arc::new(OnceLock::new());

    let mut callback = callback;
    let job_latest = latest.clone();
    let job_old = old.clone();
    let job_cleanup = cleanup.clone();
    let job_self = self_job.clone();
    let job_body = move || {
        if !id.is_active() || !resolve_dirty(id) {
            return;
        }
        call_with_error_handling(|| run_effect(id), ErrorCode::WatchGetter, instance);
        let Some(new_value) = job_latest.lock().clone() else {
            return;
        };
        let old_value = job_old.lock().clone();
        let changed = deep || old_value.as_ref() != Some(&new_value);
        if !changed {
            return;
        }
        if let Some(cleanup) = job_cleanup.take() {
            call_with_error_handling(cleanup, ErrorCode::WatchCleanup, instance);
        }
        call_with_error_handling(
            || callback(&new_value, old_value.as_ref(), &job_cleanup),
            ErrorCode::WatchCallback,
            instance,
        );
        *job_old.lock() = Some(new_value);
        if once {
            if let Some(job) = job_self.get() {
                job.deactivate();
            }
            stop_effect(id);
        }
    };
    let job = Job::with_options(
        job_body,
        JobOptions {
            id: if flush == Flush::Pre {
                instance.map(InstanceId::uid)
            } else {
                None
            },
            pre: flush == Flush::Pre,
            allow_recurse: false,
            instance,
        },
    );
    let _ = self_job.set(job.clone());

    install_flush_scheduler(id, &job, flush);

    if immediate {
        job.invoke();
    } else {
        call_with_error_handling(|| run_effect(id), ErrorCode::WatchGetter, instance);
        *old.lock() = latest.lock().clone();
    }

    WatchHandle {
        effect: id,
        job,
        cleanup,
        instance,
    }
}

/// Run a tracked closure immediately and again (pre-flush) whenever its
/// recorded dependencies change. The closure receives the cleanup
/// registrar.
pub fn watch_effect<F>(f: F) -> WatchHandle
where
    F: FnMut(&OnCleanup) + Send + 'static,
{
    watch_effect_with(f, Flush::Pre, None)
}

/// [`watch_effect`] scheduled in the post-flush phase.
pub fn watch_post_effect<F>(f: F) -> WatchHandle
where
    F: FnMut(&OnCleanup) + Send + 'static,
{
    watch_effect_with(f, Flush::Post, None)
}

/// [`watch_effect`] re-run inline as soon as a triggering write settles.
pub fn watch_sync_effect<F>(f: F) -> WatchHandle
where
    F: FnMut(&OnCleanup) + Send + 'static,
{
    watch_effect_with(f, Flush::Sync, None)
}

/// Callback-less watcher with an explicit flush phase and owner.
pub fn watch_effect_with<F>(f: F, flush: Flush, instance: Option<InstanceId>) -> WatchHandle
where
    F: FnMut(&OnCleanup) + Send + 'static,
{
    let cleanup = OnCleanup::default();
    let id = effect_arena_insert(EffectSlot::new());

    let mut f = f;
    let fn_cleanup = cleanup.clone();
    id.install_hook(
        Hook::Fn,
        Box::new(move || {
            if let Some(previous) = fn_cleanup.take() {
                call_with_error_handling(previous, ErrorCode::WatchCleanup, instance);
            }
            call_with_error_handling(|| f(&fn_cleanup), ErrorCode::WatchCallback, instance);
        }),
    );

    let job = Job::with_options(
        move || {
            if !id.is_active() {
                return;
            }
            if resolve_dirty(id) {
                run_effect(id);
            }
        },
        JobOptions {
            id: if flush == Flush::Pre {
                instance.map(InstanceId::uid)
            } else {
                None
            },
            pre: flush == Flush::Pre,
            allow_recurse: false,
            instance,
        },
    );

    install_flush_scheduler(id, &job, flush);
    run_effect(id);

    WatchHandle {
        effect: id,
        job,
        cleanup,
        instance,
    }
}

fn install_flush_scheduler(id: crate::arena::EffectId, job: &Job, flush: Flush) {
    let scheduler: Box<dyn FnMut() + Send> = match flush {
        Flush::Sync => {
            let job = job.clone();
            Box::new(move || job.invoke())
        }
        Flush::Post => {
            let job = job.clone();
            Box::new(move || queue_post_flush_cb(job.clone()))
        }
        Flush::Pre => {
            let job = job.clone();
            Box::new(move || queue_job(job.clone()))
        }
    };
    id.install_hook(Hook::Scheduler, scheduler);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Key, TargetKind};
    use crate::scheduler::{next_tick, test_support};
    use crate::track::{track, trigger, Target, TrackOp, TriggerOp};
    use std::sync::atomic::{AtomicI64, Ordering};

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
    fn pre_watcher_fires_after_tick_with_old_and_new() {
        let _serial = test_support::serial_tick();
        let x = Cell::new(1);
        let seen: Arc<Mutex<Vec<(i64, Option<i64>)>>> = Arc::new(Mutex::new(Vec::new()));

        let x_in = x.clone();
        let seen_in = seen.clone();
        let handle = watch(
            move || x_in.get(),
            move |new, old, _cleanup| {
                seen_in.lock().push((*new, old.copied()));
            },
            WatchOptions::default(),
        );

        // nothing fires until the tick is driven
        x.set(2);
        assert!(seen.lock().is_empty());

        next_tick();
        assert_eq!(*seen.lock(), vec![(2, Some(1))]);

        // unchanged value: the job runs but the callback is skipped
        x.set(2);
        next_tick();
        assert_eq!(seen.lock().len(), 1);
        handle.stop();
    }

    #[test]
    fn immediate_runs_with_no_previous_value() {
        let _serial = test_support::serial_tick();
        let x = Cell::new(7);
        let seen: Arc<Mutex<Vec<(i64, Option<i64>)>>> = Arc::new(Mutex::new(Vec::new()));

        let x_in = x.clone();
        let seen_in = seen.clone();
        let _handle = watch(
            move || x_in.get(),
            move |new, old, _cleanup| {
                seen_in.lock().push((*new, old.copied()));
            },
            WatchOptions {
                immediate: true,
                ..Default::default()
            },
        );

        assert_eq!(*seen.lock(), vec![(7, None)]);
    }

    #[test]
    fn sync_watcher_fires_without_a_tick() {
        let x = Cell::new(0);
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

        let x_in = x.clone();
        let seen_in = seen.clone();
        let _handle = watch(
            move || x_in.get(),
            move |new, _old, _cleanup| {
                seen_in.lock().push(*new);
            },
            WatchOptions {
                flush: Flush::Sync,
                ..Default::default()
            },
        );

        x.set(1);
        x.set(2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn once_stops_after_first_callback() {
        let _serial = test_support::serial_tick();
        let x = Cell::new(0);
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

        let x_in = x.clone();
        let seen_in = seen.clone();
        let _handle = watch(
            move || x_in.get(),
            move |new, _old, _cleanup| {
                seen_in.lock().push(*new);
            },
            WatchOptions {
                once: true,
                ..Default::default()
            },
        );

        x.set(1);
        next_tick();
        x.set(2);
        next_tick();
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn cleanup_runs_before_next_callback_and_on_stop() {
        let _serial = test_support::serial_tick();
        let x = Cell::new(0);
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let x_in = x.clone();
        let log_in = log.clone();
        let handle = watch(
            move || x_in.get(),
            move |new, _old, on_cleanup| {
                log_in.lock().push(format!("cb {new}"));
                let log_cleanup = log_in.clone();
                let value = *new;
                on_cleanup.set(move || {
                    log_cleanup.lock().push(format!("cleanup {value}"));
                });
            },
            WatchOptions::default(),
        );

        x.set(1);
        next_tick();
        x.set(2);
        next_tick();
        handle.stop();

        assert_eq!(
            *log.lock(),
            vec!["cb 1", "cleanup 1", "cb 2", "cleanup 2"],
        );
    }

    #[test]
    fn watch_effect_reruns_on_dependency_change() {
        let _serial = test_support::serial_tick();
        let x = Cell::new(10);
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

        let x_in = x.clone();
        let seen_in = seen.clone();
        let _handle = watch_effect(move |_cleanup| {
            seen_in.lock().push(x_in.get());
        });

        assert_eq!(*seen.lock(), vec![10]);
        x.set(11);
        next_tick();
        assert_eq!(*seen.lock(), vec![10, 11]);
    }

    #[test]
    fn deep_watcher_tracks_nested_cells() {
        let _serial = test_support::serial_tick();
        let inner = Cell::new(5);

        struct Snapshot {
            cells: Vec<Arc<Cell>>,
            sum: i64,
        }
        impl Clone for Snapshot {
            fn clone(&self) -> Self {
                Self { cells: self.cells.clone(), sum: self.sum }
            }
        }
        impl PartialEq for Snapshot {
            fn eq(&self, other: &Self) -> bool {
                self.sum == other.sum
            }
        }
        impl Traverse for Snapshot {
            fn traverse(&self, depth: u32, _seen: &mut crate::traverse::SeenSet) {
                if depth == 0 {
                    return;
                }
                for cell in &self.cells {
                    // a tracked read is how a leaf joins the dep list
                    cell.get();
                }
            }
        }

        let fires = Arc::new(AtomicI64::new(0));
        let inner_in = inner.clone();
        let fires_in = fires.clone();
        let _handle = watch(
            // the getter itself reads nothing; only traversal reaches the cell
            move || Snapshot { cells: vec![inner_in.clone()], sum: 0 },
            move |_new, _old, _cleanup| {
                fires_in.fetch_add(1, Ordering::Relaxed);
            },
            WatchOptions {
                deep: true,
                ..Default::default()
            },
        );

        inner.set(6);
        next_tick();
        assert_eq!(fires.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stopped_watcher_ignores_later_writes() {
        let _serial = test_support::serial_tick();
        let x = Cell::new(0);
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

        let x_in = x.clone();
        let seen_in = seen.clone();
        let handle = watch(
            move || x_in.get(),
            move |new, _old, _cleanup| {
                seen_in.lock().push(*new);
            },
            WatchOptions::default(),
        );

        handle.stop();
        x.set(3);
        next_tick();
        assert!(seen.lock().is_empty());
    }
}
