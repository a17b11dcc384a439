//! What gets reported, and the backends that receive it.
//!
//! A [`Reporter`] is the seam to the APM backend. It must hand reports off
//! without blocking the request path; transport, batching and retry are its
//! own business.

use std::any::Any;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::info;
use uuid::Uuid;

use super::transaction::{Context, Transaction};

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Description of an exception or panic.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Exception {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Exception {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into(), location: None }
    }

    /// Builds an exception from any error value, using its `Display` output.
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        let kind = std::any::type_name_of_val(error);
        Self::new(kind.rsplit("::").next().unwrap_or(kind), error.to_string())
    }

    /// Builds an exception from a panic payload.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with a non-string payload".to_owned());
        Self::new("panic", message)
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorEvent {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
    pub exception: Exception,
    pub handled: bool,
    pub context: Context,
    pub timestamp_us: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MessageEvent {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
    pub message: String,
    pub timestamp_us: u64,
}

/// Everything a [`Reporter`] may receive.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Report {
    Transaction(Transaction),
    Error(ErrorEvent),
    Message(MessageEvent),
}

impl Report {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transaction(_) => "transaction",
            Self::Error(_) => "error",
            Self::Message(_) => "message",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Transaction(t) => t.id(),
            Self::Error(e) => e.id,
            Self::Message(m) => m.id,
        }
    }
}

// ── Reporter ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("report queue is full")]
    QueueFull,
    #[error("report queue is closed")]
    Closed,
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Backend receiving finished transactions and captured events.
pub trait Reporter: Send + Sync + 'static {
    /// Hand `report` off. Must return promptly.
    fn report(&self, report: Report) -> Result<(), ReportError>;
}

/// Default backend: one structured `tracing` event per report, on target
/// `tsu_apm::report`, carrying the JSON payload.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, report: Report) -> Result<(), ReportError> {
        let payload = serde_json::to_string(&report)?;
        info!(target: "tsu_apm::report", kind = report.kind(), id = %report.id(), "{payload}");
        Ok(())
    }
}

/// Hands reports to a bounded queue drained by an async transport task.
/// When the queue is full the report is dropped, never awaited.
#[derive(Debug)]
pub struct ChannelReporter {
    tx: mpsc::Sender<Report>,
}

impl ChannelReporter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Report>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn report(&self, report: Report) -> Result<(), ReportError> {
        self.tx.try_send(report).map_err(|e| match e {
            TrySendError::Full(_) => ReportError::QueueFull,
            TrySendError::Closed(_) => ReportError::Closed,
        })
    }
}

/// Keeps every report in memory. Meant for tests and for asserting what an
/// instrumented application emitted.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    reports: Mutex<Vec<Report>>,
    failing: AtomicBool,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every report is rejected with [`ReportError::Rejected`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.reports().into_iter()
            .filter_map(|r| match r { Report::Transaction(t) => Some(t), _ => None })
            .collect()
    }

    pub fn errors(&self) -> Vec<ErrorEvent> {
        self.reports().into_iter()
            .filter_map(|r| match r { Report::Error(e) => Some(e), _ => None })
            .collect()
    }

    pub fn messages(&self) -> Vec<MessageEvent> {
        self.reports().into_iter()
            .filter_map(|r| match r { Report::Message(m) => Some(m), _ => None })
            .collect()
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, report: Report) -> Result<(), ReportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ReportError::Rejected(format!("{} {}", report.kind(), report.id())));
        }
        self.reports
            .lock()
            .map_err(|_| ReportError::Rejected("poisoned".to_owned()))?
            .push(report);
        Ok(())
    }
}
