// Effect arena - storage for effect state and the tracking cursor.
//
// An EffectSlot holds everything a rerunnable computation needs: its
// closures (fn, notification hook, scheduler), the owned dep list with the
// confirmed-slot cursor, the trackId generation counter, the re-entrant run
// counter, and the dirty level.
//
// DIRTY LEVELS (strictly ordered, compared with < and >=):
// - NotDirty (0): last result is current
// - QueryingDirty (1): reentrancy guard while the dirty walk is in flight
// - MaybeDirtyComputedSideEffect (2): possibly stale via a side-effectful
//   computed; scheduling is withheld until the computed is actually read
// - MaybeDirty (3): possibly stale, resolved lazily by the dirty walk
// - Dirty (4): definitely stale, must re-run

use parking_lot::{Mutex, RwLock};
use slab::Slab;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use super::dep_arena::{cleanup_dep_edge, DepId};

/// Staleness of an effect's last result - uses u8 for AtomicU8 compatibility.
///
/// Levels only matter through their ordering: notifications upgrade, the
/// dirty-resolution walk settles a MaybeDirty level to NotDirty or Dirty.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum DirtyLevel {
    /// Last result is current.
    NotDirty = 0,
    /// The dirty-resolution walk for this effect is in progress.
    QueryingDirty = 1,
    /// Possibly stale through a computed whose getter has side effects.
    MaybeDirtyComputedSideEffect = 2,
    /// Possibly stale; a computed upstream may or may not have changed.
    MaybeDirty = 3,
    /// Definitely stale.
    Dirty = 4,
}

impl DirtyLevel {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => DirtyLevel::NotDirty,
            1 => DirtyLevel::QueryingDirty,
            2 => DirtyLevel::MaybeDirtyComputedSideEffect,
            3 => DirtyLevel::MaybeDirty,
            _ => DirtyLevel::Dirty,
        }
    }
}

/// Global effect arena - stores all effect state.
static EFFECT_ARENA: RwLock<Slab<EffectSlot>> = RwLock::new(Slab::new());

// The tracking cursor and the scheduling-pause bookkeeping are thread-local:
// the engine assumes one executor per thread, while the arenas stay shared
// so a tick-loop thread can drive flushes.
thread_local! {
    static ACTIVE_EFFECT: Cell<Option<EffectId>> = const { Cell::new(None) };
    static SHOULD_TRACK: Cell<bool> = const { Cell::new(true) };
    static TRACK_STACK: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };
    static PAUSE_SCHEDULE_DEPTH: Cell<usize> = const { Cell::new(0) };
    static PENDING_SCHEDULERS: RefCell<VecDeque<EffectId>> = const { RefCell::new(VecDeque::new()) };
}

/// Get the effect currently collecting dependencies on this thread (if any).
pub(crate) fn active_effect() -> Option<EffectId> {
    ACTIVE_EFFECT.with(Cell::get)
}

/// True when reads should record dependency edges: tracking is enabled and
/// an effect is running.
pub(crate) fn is_tracking() -> bool {
    SHOULD_TRACK.with(Cell::get) && active_effect().is_some()
}

/// Disable dependency tracking until the matching [`reset_tracking`].
///
/// Pause/enable calls nest; each pushes the previous state onto a stack.
pub fn pause_tracking() {
    TRACK_STACK.with(|s| s.borrow_mut().push(SHOULD_TRACK.with(|t| t.replace(false))));
}

/// Enable dependency tracking until the matching [`reset_tracking`].
pub fn enable_tracking() {
    TRACK_STACK.with(|s| s.borrow_mut().push(SHOULD_TRACK.with(|t| t.replace(true))));
}

/// Restore the tracking state saved by the most recent pause/enable.
pub fn reset_tracking() {
    let prev = TRACK_STACK.with(|s| s.borrow_mut().pop()).unwrap_or(true);
    SHOULD_TRACK.with(|t| t.set(prev));
}

/// Run a closure with no active effect, so reads inside it record nothing.
///
/// The previous cursor is restored even if the closure panics.
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ActiveEffectGuard::new(None);
    f()
}

/// RAII guard that restores the active-effect cursor when dropped, so the
/// cursor survives panicking user closures.
pub(crate) struct ActiveEffectGuard {
    previous: Option<EffectId>,
}

impl ActiveEffectGuard {
    pub(crate) fn new(next: Option<EffectId>) -> Self {
        let previous = ACTIVE_EFFECT.with(|c| c.replace(next));
        Self { previous }
    }
}

impl Drop for ActiveEffectGuard {
    fn drop(&mut self) {
        ACTIVE_EFFECT.with(|c| c.set(self.previous));
    }
}

/// Defer effect schedulers until the matching [`reset_scheduling`].
///
/// Notifications raised while paused still upgrade dirty levels and invoke
/// trigger hooks; only the scheduler handoff is withheld. Pauses nest.
pub fn pause_scheduling() {
    PAUSE_SCHEDULE_DEPTH.with(|d| d.set(d.get() + 1));
}

/// Resume scheduling. The deferred schedulers run only when the outermost
/// pause resumes, making a whole `trigger` call one atomic notification.
pub fn reset_scheduling() {
    let depth = PAUSE_SCHEDULE_DEPTH.with(Cell::get);
    PAUSE_SCHEDULE_DEPTH.with(|d| d.set(depth.saturating_sub(1)));
    if depth <= 1 {
        drain_pending_schedulers();
    }
}

/// Hand an effect's scheduler to the pending list drained at the outermost
/// [`reset_scheduling`].
pub(crate) fn queue_effect_scheduler(effect: EffectId) {
    PENDING_SCHEDULERS.with(|q| q.borrow_mut().push_back(effect));
}

fn drain_pending_schedulers() {
    loop {
        // a scheduler may pause again; stop draining while anything is paused
        if PAUSE_SCHEDULE_DEPTH.with(Cell::get) > 0 {
            break;
        }
        let Some(effect) = PENDING_SCHEDULERS.with(|q| q.borrow_mut().pop_front()) else {
            break;
        };
        cov_mark::hit!(scheduler_drained);
        effect.call_hook(Hook::Scheduler);
    }
}

/// Selects one of the closures stored in an [`EffectSlot`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Hook {
    /// The computation itself.
    Fn,
    /// The per-notification trigger hook.
    Notify,
    /// The scheduler override.
    Scheduler,
}

type BoxedHook = Box<dyn FnMut() + Send>;

/// Unique identifier for an effect in the arena.
///
/// A zero-cost wrapper around a slab index. When the owning handle is
/// dropped it removes the slot, making the id stale; stale access returns
/// None (or an inert default).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct EffectId(u32);

impl EffectId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the effect slot with a closure (shared arena lock).
    ///
    /// Returns None if the effect has been removed (stale access).
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&EffectSlot) -> R,
    {
        let arena = EFFECT_ARENA.read();
        arena.get(self.index()).map(f)
    }

    pub(crate) fn is_active(self) -> bool {
        self.with(|slot| slot.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub(crate) fn set_active(self, active: bool) {
        self.with(|slot| slot.active.store(active, Ordering::Release));
    }

    /// Current dirty level; stale ids read as NotDirty.
    pub(crate) fn dirty_level(self) -> DirtyLevel {
        self.with(|slot| DirtyLevel::from_u8(slot.dirty.load(Ordering::Acquire)))
            .unwrap_or(DirtyLevel::NotDirty)
    }

    pub(crate) fn set_dirty_level(self, level: DirtyLevel) {
        self.with(|slot| slot.dirty.store(level as u8, Ordering::Release));
    }

    /// The live trackId generation, or None for a stale id.
    pub(crate) fn live_track_id(self) -> Option<u64> {
        self.with(|slot| slot.track_id.load(Ordering::Acquire))
    }

    pub(crate) fn track_id(self) -> u64 {
        self.live_track_id().unwrap_or(0)
    }

    pub(crate) fn should_schedule(self) -> bool {
        self.with(|slot| slot.should_schedule.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub(crate) fn set_should_schedule(self, value: bool) {
        self.with(|slot| slot.should_schedule.store(value, Ordering::Release));
    }

    pub(crate) fn allow_recurse(self) -> bool {
        self.with(|slot| slot.allow_recurse).unwrap_or(false)
    }

    pub(crate) fn runnings(self) -> u32 {
        self.with(|slot| slot.runnings.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub(crate) fn cacheable(self) -> bool {
        self.with(|slot| slot.cacheable).unwrap_or(true)
    }

    pub(crate) fn has_scheduler(self) -> bool {
        self.with(|slot| slot.scheduler.lock().is_some())
            .unwrap_or(false)
    }

    pub(crate) fn install_hook(self, hook: Hook, f: BoxedHook) {
        self.with(|slot| *slot.hook_cell(hook).lock() = Some(f));
    }

    pub(crate) fn install_on_stop(self, f: Box<dyn FnOnce() + Send>) {
        self.with(|slot| *slot.on_stop.lock() = Some(f));
    }

    pub(crate) fn take_on_stop(self) -> Option<Box<dyn FnOnce() + Send>> {
        self.with(|slot| slot.on_stop.lock().take()).flatten()
    }

    /// Run one of the slot's closures.
    ///
    /// The closure is taken out of the arena first so no lock is held while
    /// user code runs (it may re-enter the arena), and a drop guard puts it
    /// back even if the closure panics.
    pub(crate) fn call_hook(self, hook: Hook) {
        struct HookGuard {
            effect: EffectId,
            hook: Hook,
            f: Option<BoxedHook>,
        }

        impl Drop for HookGuard {
            fn drop(&mut self) {
                if let Some(f) = self.f.take() {
                    let arena = EFFECT_ARENA.read();
                    if let Some(slot) = arena.get(self.effect.index()) {
                        *slot.hook_cell(self.hook).lock() = Some(f);
                    }
                }
            }
        }

        let taken = {
            let arena = EFFECT_ARENA.read();
            arena
                .get(self.index())
                .and_then(|slot| slot.hook_cell(hook).lock().take())
        };
        // arena lock released - the closure may track, trigger, or build
        // new effects

        if let Some(f) = taken {
            let mut guard = HookGuard {
                effect: self,
                hook,
                f: Some(f),
            };
            if let Some(f) = guard.f.as_mut() {
                f();
            }
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn install_debug_taps(
        self,
        on_track: Option<BoxedHook>,
        on_trigger: Option<BoxedHook>,
    ) {
        self.with(|slot| {
            *slot.on_track_tap.lock() = on_track;
            *slot.on_trigger_tap.lock() = on_trigger;
        });
    }

    #[cfg(debug_assertions)]
    pub(crate) fn call_debug_tap(self, trigger: bool) {
        let taken = self.with(|slot| {
            let cell = if trigger { &slot.on_trigger_tap } else { &slot.on_track_tap };
            cell.lock().take()
        });
        if let Some(Some(mut f)) = taken {
            f();
            self.with(|slot| {
                let cell = if trigger { &slot.on_trigger_tap } else { &slot.on_track_tap };
                *cell.lock() = Some(f);
            });
        }
    }

    /// Install `dep` at the dep-list cursor slot and advance the cursor.
    ///
    /// Returns the dep previously occupying the slot when it differs - the
    /// caller owns cleaning that edge. A run overwrites exactly the slots
    /// whose dependencies changed; untouched prefixes are just re-confirmed.
    pub(crate) fn commit_dep_slot(self, dep: DepId) -> Option<DepId> {
        self.with(|slot| {
            let mut deps = slot.deps.lock();
            let at = deps.confirmed;
            match deps.entries.get(at).copied() {
                Some(old) if old == dep => {
                    deps.confirmed += 1;
                    None
                }
                old => {
                    if at < deps.entries.len() {
                        deps.entries[at] = dep;
                    } else {
                        deps.entries.push(dep);
                    }
                    deps.confirmed += 1;
                    old
                }
            }
        })
        .flatten()
    }

    /// Snapshot of the confirmed portion of the dep list.
    pub(crate) fn confirmed_deps(self) -> SmallVec<[DepId; 8]> {
        self.with(|slot| {
            let deps = slot.deps.lock();
            deps.entries[..deps.confirmed].iter().copied().collect()
        })
        .unwrap_or_default()
    }

    /// Drop every dep-list entry past the confirmed cursor, removing this
    /// effect from each dep unless the edge was re-recorded this run.
    pub(crate) fn prune_unconfirmed_deps(self) {
        let Some((stale, track_id)) = self.with(|slot| {
            let mut deps = slot.deps.lock();
            let confirmed = deps.confirmed;
            let stale: SmallVec<[DepId; 4]> = if deps.entries.len() > confirmed {
                deps.entries.drain(confirmed..).collect()
            } else {
                SmallVec::new()
            };
            (stale, slot.track_id.load(Ordering::Acquire))
        }) else {
            return;
        };
        for dep in stale {
            cov_mark::hit!(stale_edge_pruned);
            cleanup_dep_edge(dep, self, track_id);
        }
    }

    fn begin_run(self) {
        self.with(|slot| {
            slot.runnings.fetch_add(1, Ordering::AcqRel);
            slot.track_id.fetch_add(1, Ordering::AcqRel);
            slot.deps.lock().confirmed = 0;
        });
    }

    fn finish_run(self) {
        self.prune_unconfirmed_deps();
        self.with(|slot| slot.runnings.fetch_sub(1, Ordering::AcqRel));
    }
}

/// Ordered dep list plus the cursor of entries the current (or most recent)
/// run has confirmed.
#[derive(Default)]
pub(crate) struct DepList {
    pub(crate) entries: Vec<DepId>,
    pub(crate) confirmed: usize,
}

/// Per-effect state stored in the arena.
///
/// Closures are kept behind mutexes and taken out for the duration of a
/// call, so the arena lock never brackets user code.
pub(crate) struct EffectSlot {
    /// The computation re-run on invalidation.
    pub(crate) callback: Mutex<Option<BoxedHook>>,
    /// Invoked on each notification (computeds propagate staleness here).
    pub(crate) on_notify: Mutex<Option<BoxedHook>>,
    /// When present, notifications enqueue this instead of re-running inline.
    pub(crate) scheduler: Mutex<Option<BoxedHook>>,
    /// Invoked once when the effect is stopped.
    pub(crate) on_stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    pub(crate) deps: Mutex<DepList>,
    pub(crate) dirty: AtomicU8,
    /// Generation counter distinguishing edges of the current run from
    /// stale ones; bumped at the start of every run.
    pub(crate) track_id: AtomicU64,
    /// Re-entrant run counter.
    pub(crate) runnings: AtomicU32,
    pub(crate) active: AtomicBool,
    /// Latched when leaving NotDirty, cleared once a scheduler is enqueued.
    pub(crate) should_schedule: AtomicBool,
    /// Permits enqueueing this effect's scheduler while it is itself running.
    pub(crate) allow_recurse: bool,
    /// False forces re-evaluation on every read (eager mode for computeds).
    pub(crate) cacheable: bool,
    #[cfg(debug_assertions)]
    pub(crate) on_track_tap: Mutex<Option<BoxedHook>>,
    #[cfg(debug_assertions)]
    pub(crate) on_trigger_tap: Mutex<Option<BoxedHook>>,
}

impl EffectSlot {
    /// Fresh slot: active, dirty (never ran), tracking generation zero.
    pub(crate) fn new() -> Self {
        Self {
            callback: Mutex::new(None),
            on_notify: Mutex::new(None),
            scheduler: Mutex::new(None),
            on_stop: Mutex::new(None),
            deps: Mutex::new(DepList::default()),
            dirty: AtomicU8::new(DirtyLevel::Dirty as u8),
            track_id: AtomicU64::new(0),
            runnings: AtomicU32::new(0),
            active: AtomicBool::new(true),
            should_schedule: AtomicBool::new(false),
            allow_recurse: false,
            cacheable: true,
            #[cfg(debug_assertions)]
            on_track_tap: Mutex::new(None),
            #[cfg(debug_assertions)]
            on_trigger_tap: Mutex::new(None),
        }
    }

    fn hook_cell(&self, hook: Hook) -> &Mutex<Option<BoxedHook>> {
        match hook {
            Hook::Fn => &self.callback,
            Hook::Notify => &self.on_notify,
            Hook::Scheduler => &self.scheduler,
        }
    }
}

/// Insert an effect slot into the arena and return its id.
pub(crate) fn effect_arena_insert(slot: EffectSlot) -> EffectId {
    let mut arena = EFFECT_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(slot);
    EffectId::new(key as u32)
}

/// Remove an effect slot from the arena.
pub(crate) fn effect_arena_remove(id: EffectId) -> Option<EffectSlot> {
    let mut arena = EFFECT_ARENA.write();
    arena.try_remove(id.index())
}

// Saves the tracking flag and cursor, enables tracking, and points the
// cursor at the running effect; restored in reverse on drop.
struct RunScope {
    _cursor: ActiveEffectGuard,
}

impl RunScope {
    fn enter(effect: EffectId) -> Self {
        enable_tracking();
        Self {
            _cursor: ActiveEffectGuard::new(Some(effect)),
        }
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        // cursor restores first (field drop), then the tracking flag
        reset_tracking();
    }
}

struct RunFinishGuard {
    effect: EffectId,
}

impl Drop for RunFinishGuard {
    fn drop(&mut self) {
        self.effect.finish_run();
    }
}

/// Run an effect's computation with full dependency re-collection.
///
/// The dep-list cursor rewinds to zero, the trackId generation is bumped,
/// and on any exit path (including panics) the unconfirmed tail of the dep
/// list is pruned and the previous cursor/tracking state restored. A stopped
/// effect still runs its fn, just without tracking.
pub(crate) fn run_effect(effect: EffectId) {
    effect.set_dirty_level(DirtyLevel::NotDirty);
    if !effect.is_active() {
        effect.call_hook(Hook::Fn);
        return;
    }
    let _scope = RunScope::enter(effect);
    effect.begin_run();
    let _finish = RunFinishGuard { effect };
    effect.call_hook(Hook::Fn);
    // _finish prunes and decrements runnings, then _scope restores the cursor
}

/// Resolve a MaybeDirty level to NotDirty or Dirty and report staleness.
///
/// Walks the confirmed deps that belong to computeds and forces each to
/// refresh; a changed computed propagates Dirty back into this effect, at
/// which point the walk stops early. QueryingDirty marks the walk in flight
/// so re-entrant queries fall through instead of recursing forever, and
/// tracking is paused for the duration.
pub(crate) fn resolve_dirty(effect: EffectId) -> bool {
    let level = effect.dirty_level();
    if level == DirtyLevel::MaybeDirtyComputedSideEffect || level == DirtyLevel::MaybeDirty {
        cov_mark::hit!(dirty_walk_started);
        effect.set_dirty_level(DirtyLevel::QueryingDirty);
        pause_tracking();
        for dep in effect.confirmed_deps() {
            if let Some(owner) = dep.computed_owner() {
                refresh_computed(owner);
                if effect.dirty_level() >= DirtyLevel::Dirty {
                    cov_mark::hit!(dirty_walk_upgraded);
                    break;
                }
            }
        }
        if effect.dirty_level() == DirtyLevel::QueryingDirty {
            cov_mark::hit!(dirty_walk_settled_clean);
            effect.set_dirty_level(DirtyLevel::NotDirty);
        }
        reset_tracking();
    }
    effect.dirty_level() >= DirtyLevel::Dirty
}

/// Re-evaluate a computed's effect if it is stale (or never caches).
pub(crate) fn refresh_computed(owner: EffectId) {
    if !owner.cacheable() || resolve_dirty(owner) {
        run_effect(owner);
    }
}

/// Stop an effect: invalidate and drop every edge, run the on-stop hook,
/// and mark it inactive so it never re-runs.
pub(crate) fn stop_effect(effect: EffectId) {
    if !effect.is_active() {
        return;
    }
    // bump the generation so every recorded edge reads as stale, then prune
    effect.with(|slot| {
        slot.track_id.fetch_add(1, Ordering::AcqRel);
        slot.deps.lock().confirmed = 0;
    });
    effect.prune_unconfirmed_deps();
    if let Some(on_stop) = effect.take_on_stop() {
        on_stop();
    }
    effect.set_active(false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_access_is_inert() {
        let id = effect_arena_insert(EffectSlot::new());
        effect_arena_remove(id);

        assert!(!id.is_active());
        assert_eq!(id.live_track_id(), None);
        assert_eq!(id.dirty_level(), DirtyLevel::NotDirty);
        assert!(id.confirmed_deps().is_empty());
    }

    #[test]
    fn hook_restored_after_panic() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        let id = effect_arena_insert(EffectSlot::new());
        id.install_hook(
            Hook::Fn,
            Box::new(move || {
                if runs_in.fetch_add(1, Ordering::Relaxed) == 0 {
                    panic!("first call panics");
                }
            }),
        );

        let result = std::panic::catch_unwind(|| id.call_hook(Hook::Fn));
        assert!(result.is_err());
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        // the closure survived the panic and can run again
        id.call_hook(Hook::Fn);
        assert_eq!(runs.load(Ordering::Relaxed), 2);

        effect_arena_remove(id);
    }

    #[test]
    fn active_effect_guard_restores_on_panic() {
        let outer = EffectId::new(7);
        let inner = EffectId::new(9);

        let _outer_guard = ActiveEffectGuard::new(Some(outer));
        assert_eq!(active_effect(), Some(outer));

        let result = std::panic::catch_unwind(|| {
            let _guard = ActiveEffectGuard::new(Some(inner));
            assert_eq!(active_effect(), Some(inner));
            panic!("unwind through the guard");
        });

        assert!(result.is_err());
        assert_eq!(active_effect(), Some(outer));
    }

    #[test]
    fn tracking_stack_nests() {
        assert!(SHOULD_TRACK.with(Cell::get));
        pause_tracking();
        assert!(!SHOULD_TRACK.with(Cell::get));
        enable_tracking();
        assert!(SHOULD_TRACK.with(Cell::get));
        reset_tracking();
        assert!(!SHOULD_TRACK.with(Cell::get));
        reset_tracking();
        assert!(SHOULD_TRACK.with(Cell::get));
    }
}
