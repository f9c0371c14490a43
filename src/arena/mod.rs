// Arena storage for the dependency graph.
//
// Effects and deps reference each other; storing both sides in slab arenas
// keyed by copyable integer ids breaks the ownership cycle. Removal is
// explicit, and access through a stale id returns None.

pub(crate) mod dep_arena;
pub(crate) mod effect_arena;

pub(crate) use dep_arena::{
    cleanup_dep_edge, create_computed_dep, release_computed_dep, target_dep_or_insert,
    with_target_entry, DepId,
};
pub use dep_arena::{deregister_target, register_target, Key, TargetId, TargetKind};

pub(crate) use effect_arena::{
    active_effect, effect_arena_insert, effect_arena_remove, is_tracking, queue_effect_scheduler,
    refresh_computed, resolve_dirty, run_effect, stop_effect, DirtyLevel, EffectSlot, Hook,
};
pub use effect_arena::{
    enable_tracking, pause_scheduling, pause_tracking, reset_scheduling, reset_tracking,
    untracked, EffectId,
};
