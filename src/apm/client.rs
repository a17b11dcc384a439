//! The client handle shared by every request of an application.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use super::config::{ApmConfig, WildcardSet};
use super::report::{ErrorEvent, Exception, MessageEvent, Report, Reporter};
use super::transaction::{Context, Transaction, TransactionHandle, now_us};
use crate::error::Error;

/// Owns the validated configuration and the [`Reporter`].
///
/// Shared as `Arc<Apm>` across concurrent requests; all methods take
/// `&self`, and synchronization is the reporter's concern. Reporter
/// failures are logged and dropped here, so none of these calls can fail
/// the request that made them.
pub struct Apm {
    config: ApmConfig,
    reporter: Arc<dyn Reporter>,
    sanitizer: WildcardSet,
    ignored: WildcardSet,
}

impl Apm {
    pub fn new(config: ApmConfig, reporter: Arc<dyn Reporter>) -> Result<Self, Error> {
        config.validate()?;
        let sanitizer = WildcardSet::compile(&config.sanitize_field_names)?;
        let ignored = WildcardSet::compile(&config.transaction_ignore_urls)?;
        Ok(Self { config, reporter, sanitizer, ignored })
    }

    pub fn config(&self) -> &ApmConfig {
        &self.config
    }

    pub fn begin_transaction(&self, category: &str) -> TransactionHandle {
        let tx = Transaction::begin(category);
        debug!(id = %tx.id(), category, "transaction begun");
        TransactionHandle::new(tx)
    }

    /// Ends and reports the transaction. Returns `false` if it had already
    /// ended, in which case nothing is reported.
    pub fn end_transaction(&self, handle: &TransactionHandle) -> bool {
        let Some(mut tx) = handle.take() else {
            debug!("transaction already ended");
            return false;
        };
        tx.finish();
        debug!(id = %tx.id(), name = ?tx.name(), result = ?tx.result(), "transaction ended");
        self.emit(Report::Transaction(tx));
        true
    }

    pub fn capture_exception(&self, exception: Exception, context: Context, handled: bool) -> Uuid {
        self.report_exception(exception, context, handled, None)
    }

    pub fn capture_message(&self, message: impl Into<String>) -> Uuid {
        self.report_message(message.into(), None)
    }

    pub(crate) fn report_exception(
        &self,
        exception: Exception,
        context: Context,
        handled: bool,
        transaction: Option<&TransactionHandle>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.emit(Report::Error(ErrorEvent {
            id,
            transaction_id: transaction.and_then(TransactionHandle::id),
            exception,
            handled,
            context,
            timestamp_us: now_us(),
        }));
        id
    }

    pub(crate) fn report_message(
        &self,
        message: String,
        transaction: Option<&TransactionHandle>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.emit(Report::Message(MessageEvent {
            id,
            transaction_id: transaction.and_then(TransactionHandle::id),
            message,
            timestamp_us: now_us(),
        }));
        id
    }

    pub(crate) fn is_ignored(&self, path: &str) -> bool {
        self.ignored.matches(path)
    }

    pub(crate) fn sanitizer(&self) -> &WildcardSet {
        &self.sanitizer
    }

    fn emit(&self, report: Report) {
        let (kind, id) = (report.kind(), report.id());
        if let Err(e) = self.reporter.report(report) {
            warn!(kind, %id, "dropping apm report: {e}");
        }
    }
}

impl fmt::Debug for Apm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Apm")
            .field("service_name", &self.config.service_name)
            .field("capture_body", &self.config.capture_body)
            .field("capture_headers", &self.config.capture_headers)
            .finish_non_exhaustive()
    }
}
