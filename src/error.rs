//! Central error dispatch for user code driven by the engine.
//!
//! Jobs, watch getters/callbacks/cleanups, and schedulers all run user
//! closures; a panic in any of them must not abort the flush. Every such
//! call site goes through [`call_with_error_handling`], which contains the
//! unwind, turns it into a [`HookError`], and forwards it to the pluggable
//! handler (defaulting to `log::error!`).

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

use crate::scheduler::InstanceId;

/// Where in the pipeline a user-code error surfaced.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// A watch source getter.
    WatchGetter,
    /// A watch callback.
    WatchCallback,
    /// A watch cleanup closure.
    WatchCleanup,
    /// A scheduler job with no owner.
    Scheduler,
    /// A scheduler job owned by a component instance.
    ComponentUpdate,
    /// An error raised by the engine itself (e.g. the recursion limit) and
    /// routed to the application handler.
    AppErrorHandler,
}

impl ErrorCode {
    /// Human-readable call-site description.
    pub fn describe(self) -> &'static str {
        match self {
            ErrorCode::WatchGetter => "watcher getter",
            ErrorCode::WatchCallback => "watcher callback",
            ErrorCode::WatchCleanup => "watcher cleanup function",
            ErrorCode::Scheduler => "scheduler flush",
            ErrorCode::ComponentUpdate => "component update",
            ErrorCode::AppErrorHandler => "app error handler",
        }
    }
}

/// An error captured from user code (or raised by the engine) during a
/// tick.
#[derive(Debug, Error)]
#[error("error in {}: {message}{}", .code.describe(), fmt_instance(.instance))]
pub struct HookError {
    /// The call site that produced the error.
    pub code: ErrorCode,
    /// Owning component instance, when the job carried one.
    pub instance: Option<InstanceId>,
    /// Panic payload or engine diagnostic.
    pub message: String,
}

fn fmt_instance(instance: &Option<InstanceId>) -> String {
    match instance {
        Some(instance) => format!(" (instance uid {})", instance.uid()),
        None => String::new(),
    }
}

type Handler = Box<dyn Fn(&HookError) + Send + Sync>;

static ERROR_HANDLER: RwLock<Option<Handler>> = RwLock::new(None);

/// Install an application error handler. Captured errors are passed to it
/// instead of being logged.
pub fn set_error_handler<F>(handler: F)
where
    F: Fn(&HookError) + Send + Sync + 'static,
{
    *ERROR_HANDLER.write() = Some(Box::new(handler));
}

/// Remove the application error handler; errors fall back to the log.
pub fn reset_error_handler() {
    *ERROR_HANDLER.write() = None;
}

/// Run user code, containing any panic and reporting it under `code`.
pub(crate) fn call_with_error_handling<F>(f: F, code: ErrorCode, instance: Option<InstanceId>)
where
    F: FnOnce(),
{
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        report_error(payload_message(&*payload), code, instance);
    }
}

/// Forward an error to the handler, or log it when none is installed. A
/// panicking handler is itself contained.
pub(crate) fn report_error(message: String, code: ErrorCode, instance: Option<InstanceId>) {
    let error = HookError {
        code,
        instance,
        message,
    };
    let handler = ERROR_HANDLER.read();
    match &*handler {
        Some(handler) => {
            if catch_unwind(AssertUnwindSafe(|| handler(&error))).is_err() {
                log::error!("error handler panicked while handling: {error}");
            }
        }
        None => log::error!("{error}"),
    }
}

fn payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn panic_is_contained_and_reported() {
        let _serial = crate::scheduler::test_support::serial_tick();
        let seen: Arc<Mutex<Vec<(ErrorCode, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        set_error_handler(move |error| {
            seen_in.lock().push((error.code, error.message.clone()));
        });

        call_with_error_handling(|| panic!("boom"), ErrorCode::WatchCallback, None);

        let captured = seen.lock().clone();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, ErrorCode::WatchCallback);
        assert_eq!(captured[0].1, "boom");
        reset_error_handler();
    }

    #[test]
    fn error_message_names_instance() {
        let instance = InstanceId::next();
        let error = HookError {
            code: ErrorCode::ComponentUpdate,
            instance: Some(instance),
            message: "stale props".to_owned(),
        };
        let rendered = error.to_string();
        assert!(rendered.contains("component update"));
        assert!(rendered.contains(&instance.uid().to_string()));
    }

    #[test]
    fn panicking_handler_is_contained() {
        let _serial = crate::scheduler::test_support::serial_tick();
        set_error_handler(|_| panic!("handler exploded"));
        call_with_error_handling(|| panic!("inner"), ErrorCode::Scheduler, None);
        reset_error_handler();
    }
}
