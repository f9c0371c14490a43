#![deny(missing_docs)]

//! Fine-grained reactivity core with a deterministic tick scheduler.
//!
//! This crate tracks which computations depend on which mutable state,
//! recomputes them when that state changes, and orders the recomputations
//! deterministically across a single logical tick. It is rendering-agnostic:
//! a proxy layer (yours) intercepts reads and writes and reports them via
//! [`track`] and [`trigger`]; this crate owns the dependency graph, the
//! effects, and the scheduler.
//!
//! # Quick Start
//!
//! ```ignore
//! use finegrain::{effect, track, trigger, Key, Target, TargetKind, TrackOp, TriggerOp};
//!
//! struct Temperature {
//!     celsius: f64,
//!     target: Target, // reactive identity, reads/writes report through it
//! }
//!
//! impl Temperature {
//!     fn get(&self) -> f64 {
//!         track(self.target.id(), TrackOp::Get, Key::prop("celsius"));
//!         self.celsius
//!     }
//!     fn set(&mut self, v: f64) {
//!         self.celsius = v;
//!         trigger(self.target.id(), TriggerOp::Set, Some(Key::prop("celsius")), None);
//!     }
//! }
//!
//! // Effects run immediately and re-run when tracked reads change
//! let runner = effect(move || {
//!     println!("{}°C", sensor.get());
//! });
//! ```
//!
//! # Core Types
//!
//! - [`effect`] / [`ReactiveEffect`] - a rerunnable computation that
//!   re-collects its dependencies on every run.
//! - [`Computed`] - a lazy, cached derived value; chains re-evaluate only
//!   what a read actually pulls.
//! - [`watch`] / [`watch_effect`] - a tracked getter plus a user callback,
//!   scheduled pre, post, or synchronously.
//! - [`Job`] / [`queue_job`] / [`next_tick`] - the tick scheduler:
//!   deduplicated jobs in `(id, pre)` order, post-flush callbacks, recursion
//!   capped at 100.
//!
//! # The tick
//!
//! Writes never run effects in place (unless a watcher is `Sync`): they
//! enqueue jobs. Driving the tick with [`next_tick`] (or a background
//! [`TickLoop`]) flushes pre and main jobs in `(id, pre)` order, then the
//! post-flush callbacks in id order, repeating until quiescent. Instance
//! uids are allocated in creation order, so parent updates run before their
//! children's.
//!
//! # Batching and escape hatches
//!
//! - [`pause_scheduling`] / [`reset_scheduling`] make a group of writes one
//!   atomic notification.
//! - [`pause_tracking`] / [`enable_tracking`] / [`reset_tracking`] and
//!   [`untracked`] control dependency collection.
//! - [`set_error_handler`] observes panics captured from user code; a
//!   captured panic never aborts a flush.

pub(crate) mod arena;
mod computed;
mod effect;
mod error;
mod executor;
mod hash;
mod scheduler;
mod track;
mod traverse;
mod watch;

pub use arena::{
    deregister_target, enable_tracking, pause_scheduling, pause_tracking, register_target,
    reset_scheduling, reset_tracking, untracked, Key, TargetId, TargetKind,
};
pub use computed::Computed;
pub use effect::{effect, effect_with_options, stop, EffectOptions, ReactiveEffect};
pub use error::{reset_error_handler, set_error_handler, ErrorCode, HookError};
pub use executor::{spawn_tick_loop, TickLoop, DEFAULT_DEBOUNCE, DEFAULT_MAX_DEBOUNCE};
pub use scheduler::{
    flush_pre_flush_cbs, invalidate_job, next_tick, next_tick_with, queue_job,
    queue_post_flush_cb, queue_post_flush_cbs, InstanceId, Job, JobOptions,
};
pub use track::{track, trigger, Target, TrackOp, TriggerOp};
pub use traverse::{traverse, Opaque, SeenSet, Traverse};
pub use watch::{
    watch, watch_effect, watch_effect_with, watch_post_effect, watch_sync_effect, Flush,
    OnCleanup, WatchHandle, WatchOptions,
};
