//! Process-wide instrumentation.
//!
//! The only global hook is a panic hook: panics outside request handling
//! (background tasks, startup code) are reported as unhandled exceptions.
//! Panics inside a handler are left to the request's adapter, which knows
//! the request they belong to.

use std::future::Future;
use std::panic;
use std::sync::{Arc, Once};

use super::client::Apm;
use super::report::Exception;
use super::transaction::Context;

static INSTALL: Once = Once::new();

tokio::task_local! {
    static IN_REQUEST: ();
}

/// Installs the panic hook, reporting through `apm`. Only the first call in
/// a process has an effect; returns whether this call installed it.
pub(crate) fn install(apm: &Arc<Apm>) -> bool {
    let mut installed = false;
    INSTALL.call_once(|| {
        let apm = Arc::clone(apm);
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !in_request() {
                let mut exception = Exception::from_panic(info.payload());
                if let Some(location) = info.location() {
                    exception = exception.with_location(location.to_string());
                }
                apm.capture_exception(exception, Context::new(), false);
            }
            previous(info);
        }));
        installed = true;
    });
    installed
}

/// Runs `fut` marked as request handling.
pub(crate) fn request_scope<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    IN_REQUEST.scope((), fut)
}

pub(crate) fn in_request() -> bool {
    IN_REQUEST.try_with(|_| ()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apm::{ApmConfig, MemoryReporter};

    #[test]
    fn installs_at_most_once() {
        let apm = Arc::new(Apm::new(ApmConfig::default(), Arc::new(MemoryReporter::new())).unwrap());
        install(&apm);
        assert!(!install(&apm));
        assert!(INSTALL.is_completed());
    }

    #[tokio::test]
    async fn request_scope_is_visible_inside_only() {
        assert!(!in_request());
        assert!(request_scope(async { in_request() }).await);
        assert!(!in_request());
    }
}
