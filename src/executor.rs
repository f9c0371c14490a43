//! Background driver for the tick scheduler.
//!
//! Synchronous callers drive ticks themselves with
//! [`next_tick`](crate::scheduler::next_tick). For event-loop applications
//! this module provides the push side: [`queue_flush`] notifications wake a
//! spawned loop thread, which debounces bursts of notifications and then
//! runs the flush.
//!
//! ## Usage
//!
//! ```ignore
//! // Default configuration
//! TickLoop::new().spawn();
//!
//! // Or with custom debouncing and thread setup
//! TickLoop::new()
//!     .debounce(Duration::from_millis(2))
//!     .max_debounce(Duration::from_millis(10))
//!     .spawn_fn(|f| {
//!         std::thread::Builder::new()
//!             .name("tick-loop".into())
//!             .spawn(f)
//!             .unwrap()
//!     })
//!     .spawn();
//! ```
//!
//! When no loop is spawned, notifications are no-ops and the scheduler
//! stays fully synchronous.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::OnceLock;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::scheduler::next_tick;

/// Global sender for waking the tick loop.
///
/// Lazily initialized by [`TickLoop::spawn`]; until then notifications are
/// no-ops.
static TICK_NOTIFIER: OnceLock<Sender<()>> = OnceLock::new();

/// Wake the tick loop (if one is running) because a flush became pending.
///
/// Non-blocking and safe from any context.
pub(crate) fn notify_tick_loop() {
    if let Some(sender) = TICK_NOTIFIER.get() {
        // a send error just means the loop has exited
        let _ = sender.send(());
    }
}

/// Default debounce delay before a notified flush runs.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1);

/// Default upper bound on debouncing under a constant notification stream.
pub const DEFAULT_MAX_DEBOUNCE: Duration = Duration::from_millis(8);

/// Builder for the background tick-driving thread.
#[allow(clippy::type_complexity)]
pub struct TickLoop {
    debounce: Duration,
    max_debounce: Duration,
    spawn_fn: Option<Box<dyn FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send>>,
}

impl Default for TickLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl TickLoop {
    /// Builder with the default debounce settings and `thread::spawn`.
    pub fn new() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            max_debounce: DEFAULT_MAX_DEBOUNCE,
            spawn_fn: None,
        }
    }

    /// Wait this long after a notification before flushing; further
    /// notifications inside the window reset the timer.
    pub fn debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Flush no later than this after the first notification, even under a
    /// constant stream.
    pub fn max_debounce(mut self, duration: Duration) -> Self {
        self.max_debounce = duration;
        self
    }

    /// Custom thread spawning (name, stack size, priority).
    pub fn spawn_fn<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send + 'static,
    {
        self.spawn_fn = Some(Box::new(f));
        self
    }

    /// Spawn the loop thread and register it as the flush notifier.
    ///
    /// The thread blocks on the channel while idle (zero CPU), debounces
    /// notification bursts, then drives [`next_tick`].
    pub fn spawn(self) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel::<()>();
        let _ = TICK_NOTIFIER.set(tx);

        let debounce = self.debounce;
        let max_debounce = self.max_debounce;
        let loop_fn: Box<dyn FnOnce() + Send> = Box::new(move || {
            tick_loop(&rx, debounce, max_debounce);
        });

        match self.spawn_fn {
            Some(spawn_fn) => spawn_fn(loop_fn),
            None => thread::spawn(loop_fn),
        }
    }
}

fn tick_loop(rx: &Receiver<()>, debounce: Duration, max_debounce: Duration) {
    loop {
        // block until something needs flushing
        if rx.recv().is_err() {
            break;
        }

        // debounce: each new notification resets the timer, bounded by the
        // maximum wait
        let started = Instant::now();
        loop {
            if started.elapsed() >= max_debounce {
                break;
            }
            let remaining = max_debounce.saturating_sub(started.elapsed());
            match rx.recv_timeout(debounce.min(remaining)) {
                Ok(()) => {}
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }

        // collapse whatever arrived while debouncing
        loop {
            match rx.try_recv() {
                Ok(()) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        next_tick();
    }
}

/// Spawn the tick loop with default settings.
pub fn spawn_tick_loop() -> JoinHandle<()> {
    TickLoop::new().spawn()
}
