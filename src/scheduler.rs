//! The tick scheduler: a deterministic pre/flush/post pipeline.
//!
//! Mutations enqueue jobs; nothing runs until the tick is driven (by
//! [`next_tick`] or a spawned [`TickLoop`](crate::executor::TickLoop)). One
//! flush then runs the queued jobs in `(id, pre)` order, runs the post-flush
//! callbacks in id order, and repeats until both queues are quiescent.
//!
//! Ordering rules:
//! - smaller id first; a missing id sorts last
//! - within one id, pre-flagged jobs run before non-pre jobs
//! - a job is deduplicated against the not-yet-flushed tail of the queue,
//!   so it runs at most once per flush unless it allows recursion
//! - a job that re-enqueues itself more than 100 times in one flush is
//!   reported through the error dispatch and dropped

use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{self, ErrorCode};
use crate::hash::FastMap;

/// Runaway-feedback cap: invocations of one job within a single flush.
const RECURSION_LIMIT: u32 = 100;

/// Owner handle supplied by an external component layer.
///
/// Uids are allocated in creation order, so a parent always has a smaller
/// uid than its children and the queue ordering runs parents first. Jobs
/// carrying an instance attribute their errors to it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u32);

static NEXT_INSTANCE_UID: AtomicU32 = AtomicU32::new(0);

impl InstanceId {
    /// Allocate the next uid in creation order.
    pub fn next() -> Self {
        Self(NEXT_INSTANCE_UID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw uid.
    pub fn uid(self) -> u32 {
        self.0
    }
}

/// Construction knobs for [`Job::with_options`].
#[derive(Default, Clone, Copy)]
pub struct JobOptions {
    /// Queue position; `None` sorts after every numbered job.
    pub id: Option<u32>,
    /// Run before non-pre jobs of the same id.
    pub pre: bool,
    /// Allow the job to re-enqueue itself during its own run.
    pub allow_recurse: bool,
    /// Owner, for ordering conventions and error attribution.
    pub instance: Option<InstanceId>,
}

struct JobInner {
    callback: Mutex<Option<Box<dyn FnMut() + Send>>>,
    id: Option<u32>,
    pre: bool,
    allow_recurse: bool,
    active: AtomicBool,
    instance: Option<InstanceId>,
}

/// A schedulable callable. Clones share identity; dedup and invalidation
/// compare the shared allocation, not the closure.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    /// A plain job with no id (runs after every numbered job).
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::with_options(f, JobOptions::default())
    }

    /// A job with explicit ordering/ownership options.
    pub fn with_options<F>(f: F, options: JobOptions) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self {
            inner: Arc::new(JobInner {
                callback: Mutex::new(Some(Box::new(f))),
                id: options.id,
                pre: options.pre,
                allow_recurse: options.allow_recurse,
                active: AtomicBool::new(true),
                instance: options.instance,
            }),
        }
    }

    /// Queue position, if any.
    pub fn id(&self) -> Option<u32> {
        self.inner.id
    }

    /// Whether this job runs in the pre phase of its id.
    pub fn is_pre(&self) -> bool {
        self.inner.pre
    }

    /// Owner instance, if any.
    pub fn instance(&self) -> Option<InstanceId> {
        self.inner.instance
    }

    /// A deactivated job stays queued but is skipped by the flush (e.g. a
    /// child unmounted by its parent's update).
    pub fn deactivate(&self) {
        self.inner.active.store(false, Ordering::Release);
    }

    /// Whether the flush will still run this job.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Invoke the callback now. Re-entrant invocation of the same job is a
    /// no-op (the callback is checked out for the duration of the call).
    pub fn invoke(&self) {
        struct Restore<'a> {
            job: &'a Job,
            f: Option<Box<dyn FnMut() + Send>>,
        }
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                if let Some(f) = self.f.take() {
                    *self.job.inner.callback.lock() = Some(f);
                }
            }
        }

        let taken = self.inner.callback.lock().take();
        if let Some(f) = taken {
            let mut restore = Restore { job: self, f: Some(f) };
            if let Some(f) = restore.f.as_mut() {
                f();
            }
        }
    }

    fn sort_id(&self) -> u64 {
        self.inner.id.map_or(u64::MAX, u64::from)
    }

    fn same(&self, other: &Job) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn ptr(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

struct SchedulerState {
    queue: Vec<Job>,
    flush_index: usize,
    pending_post: Vec<Job>,
    active_post: Option<Vec<Job>>,
    post_index: usize,
    is_flushing: bool,
    is_flush_pending: bool,
    after_flush: Vec<Box<dyn FnOnce() + Send>>,
}

impl SchedulerState {
    const fn new() -> Self {
        Self {
            queue: Vec::new(),
            flush_index: 0,
            pending_post: Vec::new(),
            active_post: None,
            post_index: 0,
            is_flushing: false,
            is_flush_pending: false,
            after_flush: Vec::new(),
        }
    }
}

static SCHEDULER: Mutex<SchedulerState> = Mutex::new(SchedulerState::new());

/// Enqueue a job for the next flush.
///
/// Deduplicated against the not-yet-flushed tail of the queue; a currently
/// running job can only re-enqueue itself when it allows recursion (the
/// search window then starts one past the running slot). Numbered jobs are
/// spliced into `(id, pre)` position so jobs queued mid-flush still run in
/// order.
pub fn queue_job(job: Job) {
    let mut state = SCHEDULER.lock();
    let window_start = if state.is_flushing && job.inner.allow_recurse {
        state.flush_index + 1
    } else {
        state.flush_index
    };
    let duplicate = state
        .queue
        .get(window_start..)
        .is_some_and(|tail| tail.iter().any(|queued| queued.same(&job)));
    if duplicate {
        cov_mark::hit!(job_deduplicated);
        return;
    }

    if job.inner.id.is_none() {
        state.queue.push(job);
    } else {
        let at = find_insertion_index(&state, &job);
        state.queue.insert(at, job);
    }
    queue_flush(&mut state);
}

/// Binary search the first index past every job ordered before `job`,
/// never before the slot currently being flushed.
fn find_insertion_index(state: &SchedulerState, job: &Job) -> usize {
    let id = job.sort_id();
    let mut start = (state.flush_index + 1).min(state.queue.len());
    let mut end = state.queue.len();
    while start < end {
        let middle = (start + end) >> 1;
        let probe = &state.queue[middle];
        if probe.sort_id() < id || (probe.sort_id() == id && probe.inner.pre) {
            start = middle + 1;
        } else {
            end = middle;
        }
    }
    start
}

fn queue_flush(state: &mut SchedulerState) {
    if !state.is_flushing && !state.is_flush_pending {
        state.is_flush_pending = true;
        crate::executor::notify_tick_loop();
    }
}

/// Enqueue a callback for the post phase of the next flush.
///
/// Deduplicated against the remainder of the currently active post batch,
/// if one is running.
pub fn queue_post_flush_cb(cb: Job) {
    let mut state = SCHEDULER.lock();
    if let Some(active) = &state.active_post {
        let window_start = if cb.inner.allow_recurse {
            state.post_index + 1
        } else {
            state.post_index
        };
        if active
            .get(window_start..)
            .is_some_and(|tail| tail.iter().any(|queued| queued.same(&cb)))
        {
            return;
        }
    }
    state.pending_post.push(cb);
    queue_flush(&mut state);
}

/// Enqueue a pre-deduplicated batch of post callbacks (e.g. a lifecycle
/// bundle) without a dedup pass.
pub fn queue_post_flush_cbs(cbs: impl IntoIterator<Item = Job>) {
    let mut state = SCHEDULER.lock();
    state.pending_post.extend(cbs);
    queue_flush(&mut state);
}

/// Pull every queued pre-flagged job (optionally only those owned by
/// `instance`) out of the queue and run it immediately.
///
/// Lets a pre-watcher observe consistent parent state before the parent's
/// own update job runs. During a flush, the scan starts just past the job
/// currently running.
pub fn flush_pre_flush_cbs(instance: Option<InstanceId>) {
    let mut scan = {
        let state = SCHEDULER.lock();
        if state.is_flushing {
            state.flush_index + 1
        } else {
            0
        }
    };
    loop {
        let extracted = {
            let mut state = SCHEDULER.lock();
            let mut found = None;
            while scan < state.queue.len() {
                let job = &state.queue[scan];
                if job.is_pre() {
                    if let Some(owner) = instance {
                        if job.inner.id != Some(owner.uid()) {
                            scan += 1;
                            continue;
                        }
                    }
                    found = Some(state.queue.remove(scan));
                    break;
                }
                scan += 1;
            }
            found
        };
        let Some(job) = extracted else { break };
        if job.is_active() {
            error::call_with_error_handling(|| job.invoke(), job_error_code(&job), job.instance());
        }
    }
}

/// Remove a queued job, but never one at or before the flush cursor (a
/// running or already-run job cannot be cancelled).
pub fn invalidate_job(job: &Job) {
    let mut state = SCHEDULER.lock();
    if let Some(position) = state.queue.iter().position(|queued| queued.same(job)) {
        if position > state.flush_index {
            state.queue.remove(position);
        }
    }
}

/// Drive any pending flush to quiescence on the calling thread.
///
/// After this returns, every job scheduled by earlier mutations has run
/// (including jobs those jobs scheduled). Calling it again with nothing
/// pending returns immediately. A call from inside a running job is a
/// no-op; use [`next_tick_with`] there.
pub fn next_tick() {
    loop {
        let runnable = {
            let state = SCHEDULER.lock();
            state.is_flush_pending && !state.is_flushing
        };
        if !runnable {
            break;
        }
        flush_jobs_entry();
    }
}

/// Like [`next_tick`], then run `f` once the tick has settled. From inside
/// a running job, `f` is deferred to the end of the current flush instead.
pub fn next_tick_with<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    {
        let mut state = SCHEDULER.lock();
        if state.is_flushing {
            state.after_flush.push(Box::new(f));
            return;
        }
    }
    next_tick();
    f();
}

type SeenCounts = FastMap<usize, u32>;

/// One full flush: jobs, post callbacks, recursion until quiescent, then
/// the settled callbacks registered by [`next_tick_with`].
pub(crate) fn flush_jobs_entry() {
    let mut seen = SeenCounts::default();
    flush_jobs(&mut seen);
    loop {
        let settled = {
            let mut state = SCHEDULER.lock();
            std::mem::take(&mut state.after_flush)
        };
        if settled.is_empty() {
            break;
        }
        for cb in settled {
            cb();
        }
        // the settled callbacks may have scheduled more work
        let pending = { SCHEDULER.lock().is_flush_pending };
        if pending {
            let mut seen = SeenCounts::default();
            flush_jobs(&mut seen);
        }
    }
}

fn job_order(a: &Job, b: &Job) -> CmpOrdering {
    a.sort_id()
        .cmp(&b.sort_id())
        .then_with(|| b.is_pre().cmp(&a.is_pre()))
}

fn job_error_code(job: &Job) -> ErrorCode {
    if job.instance().is_some() {
        ErrorCode::ComponentUpdate
    } else {
        ErrorCode::Scheduler
    }
}

fn flush_jobs(seen: &mut SeenCounts) {
    {
        let mut state = SCHEDULER.lock();
        state.is_flush_pending = false;
        state.is_flushing = true;
        // jobs queued while idle land in arrival order; restore (id, pre)
        // order before the walk
        state.queue.sort_by(job_order);
    }

    loop {
        let job = {
            let state = SCHEDULER.lock();
            state.queue.get(state.flush_index).cloned()
        };
        let Some(job) = job else { break };
        if job.is_active() && !exceeds_recursion_limit(seen, &job) {
            error::call_with_error_handling(|| job.invoke(), job_error_code(&job), job.instance());
        }
        SCHEDULER.lock().flush_index += 1;
    }

    {
        let mut state = SCHEDULER.lock();
        state.flush_index = 0;
        state.queue.clear();
    }

    flush_post_flush_cbs(seen);

    let keep_going = {
        let mut state = SCHEDULER.lock();
        state.is_flushing = false;
        !state.queue.is_empty() || !state.pending_post.is_empty()
    };
    if keep_going {
        cov_mark::hit!(flush_recursed);
        flush_jobs(seen);
    }
}

/// Run the pending post-flush callbacks: uniquified, ordered by id, with
/// the same recursion guard as main jobs. A nested call while a post batch
/// is active splices into that batch instead of starting another.
pub(crate) fn flush_post_flush_cbs(seen: &mut SeenCounts) {
    {
        let mut state = SCHEDULER.lock();
        if state.pending_post.is_empty() {
            return;
        }
        let mut batch: Vec<Job> = Vec::with_capacity(state.pending_post.len());
        let mut known = FastMap::<usize, ()>::default();
        for job in state.pending_post.drain(..) {
            if known.insert(job.ptr(), ()).is_none() {
                batch.push(job);
            }
        }
        batch.sort_by(|a, b| a.sort_id().cmp(&b.sort_id()));

        if let Some(active) = &mut state.active_post {
            cov_mark::hit!(nested_post_flush);
            active.extend(batch);
            return;
        }
        state.active_post = Some(batch);
    }

    loop {
        let job = {
            let state = SCHEDULER.lock();
            state
                .active_post
                .as_ref()
                .and_then(|batch| batch.get(state.post_index).cloned())
        };
        let Some(job) = job else { break };
        if job.is_active() && !exceeds_recursion_limit(seen, &job) {
            error::call_with_error_handling(|| job.invoke(), job_error_code(&job), job.instance());
        }
        SCHEDULER.lock().post_index += 1;
    }

    let mut state = SCHEDULER.lock();
    state.active_post = None;
    state.post_index = 0;
}

/// Count invocations of one job within this flush; past the limit the job
/// is reported (exactly once) and skipped.
fn exceeds_recursion_limit(seen: &mut SeenCounts, job: &Job) -> bool {
    let count = seen.entry(job.ptr()).or_insert(0);
    *count += 1;
    if *count <= RECURSION_LIMIT {
        return false;
    }
    if *count == RECURSION_LIMIT + 1 {
        cov_mark::hit!(recursion_limit_tripped);
        error::report_error(
            format!(
                "maximum recursive updates exceeded: a job re-enqueued itself more than \
                 {RECURSION_LIMIT} times in one flush; this is usually a reactive feedback loop \
                 where an update writes state it also depends on"
            ),
            ErrorCode::AppErrorHandler,
            job.instance(),
        );
    }
    true
}
