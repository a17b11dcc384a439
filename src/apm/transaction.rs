//! The monitored unit of work behind one request.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

/// Context bag attached to transactions and error reports.
pub type Context = BTreeMap<String, Value>;

/// One request's monitored span.
#[derive(Clone, Debug, Serialize)]
pub struct Transaction {
    id: Uuid,
    #[serde(rename = "type")]
    category: String,
    name: Option<String>,
    result: Option<String>,
    context: Context,
    timestamp_us: u64,
    duration_ms: Option<f64>,
    #[serde(skip)]
    started: Instant,
}

impl Transaction {
    pub(crate) fn begin(category: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: category.to_owned(),
            name: None,
            result: None,
            context: Context::new(),
            timestamp_us: now_us(),
            duration_ms: None,
            started: Instant::now(),
        }
    }

    pub(crate) fn finish(&mut self) {
        self.duration_ms = Some(self.started.elapsed().as_secs_f64() * 1000.0);
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn category(&self) -> &str { &self.category }
    pub fn name(&self) -> Option<&str> { self.name.as_deref() }
    pub fn result(&self) -> Option<&str> { self.result.as_deref() }
    pub fn context(&self) -> &Context { &self.context }
    pub fn timestamp_us(&self) -> u64 { self.timestamp_us }
    /// Set once the transaction has ended.
    pub fn duration_ms(&self) -> Option<f64> { self.duration_ms }
}

pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Request-scoped access to the open [`Transaction`].
///
/// Clones share the same transaction. Once it has ended, every setter
/// becomes a no-op and returns `false`.
#[derive(Clone, Debug)]
pub struct TransactionHandle(Arc<Mutex<Option<Transaction>>>);

impl TransactionHandle {
    pub(crate) fn new(transaction: Transaction) -> Self {
        Self(Arc::new(Mutex::new(Some(transaction))))
    }

    fn lock(&self) -> MutexGuard<'_, Option<Transaction>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` after the transaction has ended.
    pub fn id(&self) -> Option<Uuid> {
        self.lock().as_ref().map(Transaction::id)
    }

    pub fn is_ended(&self) -> bool {
        self.lock().is_none()
    }

    /// Sets the name unless one is already set; `override_existing` forces it.
    pub fn set_name(&self, name: impl Into<String>, override_existing: bool) -> bool {
        match self.lock().as_mut() {
            Some(tx) if tx.name.is_none() || override_existing => {
                tx.name = Some(name.into());
                true
            }
            _ => false,
        }
    }

    /// Sets the result unless one is already set; `override_existing` forces it.
    pub fn set_result(&self, result: impl Into<String>, override_existing: bool) -> bool {
        match self.lock().as_mut() {
            Some(tx) if tx.result.is_none() || override_existing => {
                tx.result = Some(result.into());
                true
            }
            _ => false,
        }
    }

    /// Stores `provider()` under `key`. The provider only runs while the
    /// transaction is open, and runs without the lock held so it may use
    /// this handle itself.
    pub fn set_context<T, F>(&self, key: impl Into<String>, provider: F) -> bool
    where
        T: Serialize,
        F: FnOnce() -> T,
    {
        if self.is_ended() {
            return false;
        }
        let key = key.into();
        let value = match serde_json::to_value(provider()) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, "dropping transaction context: {e}");
                return false;
            }
        };
        // The transaction may have ended while the provider ran.
        match self.lock().as_mut() {
            Some(tx) => {
                tx.context.insert(key, value);
                true
            }
            None => false,
        }
    }

    /// A copy of the transaction as it currently stands.
    pub fn snapshot(&self) -> Option<Transaction> {
        self.lock().clone()
    }

    pub(crate) fn take(&self) -> Option<Transaction> {
        self.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TransactionHandle {
        TransactionHandle::new(Transaction::begin("request"))
    }

    #[test]
    fn first_writer_wins_without_override() {
        let tx = handle();
        assert!(tx.set_name("GET /custom", false));
        assert!(!tx.set_name("GET /derived", false));
        assert!(tx.set_result("HTTP 2xx", false));
        assert!(!tx.set_result("HTTP 5xx", false));

        let t = tx.snapshot().unwrap();
        assert_eq!(t.name(), Some("GET /custom"));
        assert_eq!(t.result(), Some("HTTP 2xx"));
    }

    #[test]
    fn override_replaces_existing_values() {
        let tx = handle();
        tx.set_name("a", false);
        assert!(tx.set_name("b", true));
        assert_eq!(tx.snapshot().unwrap().name(), Some("b"));
    }

    #[test]
    fn ended_transaction_ignores_writes_and_skips_providers() {
        let tx = handle();
        let taken = tx.take();
        assert!(taken.is_some());
        assert!(tx.is_ended());
        assert!(tx.take().is_none());
        assert!(!tx.set_name("late", true));
        assert!(!tx.set_context("late", || -> Value { panic!("provider must not run") }));
        assert_eq!(tx.id(), None);
    }

    #[test]
    fn context_values_are_serialized() {
        let tx = handle();
        assert!(tx.set_context("user", || serde_json::json!({"id": 7})));
        let t = tx.take().unwrap();
        assert_eq!(t.context()["user"]["id"], 7);
    }

    #[test]
    fn providers_may_use_the_same_handle() {
        let tx = handle();
        let inner = tx.clone();
        let (done, finished) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let stored = tx.set_context("tx_id", || inner.id().map(|id| id.to_string()));
            let renamed = tx.set_context("renamed", || inner.set_name("from provider", false));
            let _ = done.send((stored, renamed, tx.take()));
        });

        let (stored, renamed, taken) = finished
            .recv_timeout(std::time::Duration::from_secs(3))
            .expect("set_context blocked on its own handle");
        assert!(stored && renamed);
        let t = taken.unwrap();
        assert_eq!(t.context()["tx_id"], t.id().to_string());
        assert_eq!(t.context()["renamed"], true);
        assert_eq!(t.name(), Some("from provider"));
    }

    #[test]
    fn provider_that_ends_the_transaction_stores_nothing() {
        let tx = handle();
        let inner = tx.clone();
        assert!(!tx.set_context("late", || inner.take().is_some()));
        assert!(tx.is_ended());
    }

    #[test]
    fn finish_records_duration() {
        let mut t = Transaction::begin("request");
        assert!(t.duration_ms().is_none());
        t.finish();
        assert!(t.duration_ms().unwrap() >= 0.0);
        assert_eq!(t.category(), "request");
    }
}
