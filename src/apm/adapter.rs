//! Per-request transaction lifecycle.
//!
//! ```text
//!  [idle] --prepare()--> [open] --on_success() / drop--> [closed]
//!                          on_error() reports, stays [open]
//! ```
//!
//! A [`TransactionAdapter`] lives in the dispatch future of exactly one
//! request. Whichever way that future ends, the transaction is ended exactly
//! once: by `on_success`, or by `Drop` when the request is abandoned.

use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use tracing::{debug, trace};

use super::client::Apm;
use super::report::Exception;
use super::snapshot;
use super::transaction::{Context, TransactionHandle};
use crate::request::{Request, RequestHead};
use crate::response::Response;

/// Category label of request transactions.
pub const REQUEST_CATEGORY: &str = "request";

/// Route names keep at most this many path segments.
pub const MAX_ROUTE_SEGMENTS: usize = 5;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum RouteNameError {
    #[error("no route matched the request path")]
    Unmatched,
    #[error("path has {actual} segments but route `{template}` needs {expected}")]
    SegmentMismatch { template: String, expected: usize, actual: usize },
}

/// Derives a low-cardinality transaction name from the matched route.
///
/// Trailing parameter segments of the template are dropped, the remaining
/// template positions are filled from the concrete path, and the result is
/// cut to [`MAX_ROUTE_SEGMENTS`]. `/api/v1/items/{id}` on `/api/v1/items/42`
/// yields `/api/v1/items`.
pub fn resolve_route_name(template: Option<&str>, path: &str) -> Result<String, RouteNameError> {
    let template = template.ok_or(RouteNameError::Unmatched)?;
    let is_param = |segment: &&str| segment.contains('{');

    let template_segments: Vec<&str> = template.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let named = template_segments.iter().rposition(|s| !is_param(s)).map_or(0, |i| i + 1);
    if path_segments.len() < named {
        return Err(RouteNameError::SegmentMismatch {
            template: template.to_owned(),
            expected: named,
            actual: path_segments.len(),
        });
    }

    let kept = &path_segments[..named.min(MAX_ROUTE_SEGMENTS)];
    Ok(format!("/{}", kept.join("/")))
}

/// `"HTTP 2xx"` for 201, `"HTTP 4xx"` for 404, and so on.
pub fn classify_result(status: StatusCode) -> String {
    format!("HTTP {}xx", status.as_u16() / 100)
}

enum State {
    Idle,
    Open(TransactionHandle),
    Closed,
}

/// Drives one request's transaction through the client handle.
pub struct TransactionAdapter {
    apm: Option<Arc<Apm>>,
    head: Option<RequestHead>,
    state: State,
}

impl TransactionAdapter {
    pub fn new(apm: Option<Arc<Apm>>) -> Self {
        Self { apm, head: None, state: State::Idle }
    }

    /// Opens the transaction before any handler code runs.
    ///
    /// Does nothing without a bound client handle, for ignored paths, or
    /// when called a second time.
    pub fn prepare(&mut self, req: &Request) -> Option<TransactionHandle> {
        let apm = self.apm.as_ref()?;
        if !matches!(self.state, State::Idle) {
            return None;
        }
        self.head = Some(req.head().clone());
        if apm.is_ignored(req.path()) {
            trace!(path = req.path(), "path ignored by apm");
            return None;
        }
        let handle = apm.begin_transaction(REQUEST_CATEGORY);
        self.state = State::Open(handle.clone());
        Some(handle)
    }

    /// Records the body once it has been read. [`prepare`](Self::prepare)
    /// runs before the body is collected.
    pub(crate) fn attach_body(&mut self, body: Bytes) {
        if let Some(head) = self.head.as_mut() {
            head.body = body;
        }
    }

    /// Reports an unhandled error with the request's headers but never its
    /// body. The transaction stays open for [`on_success`](Self::on_success).
    pub fn on_error(&mut self, exception: Exception) {
        let (Some(apm), Some(head)) = (self.apm.as_ref(), self.head.as_ref()) else { return };
        let mut context = Context::new();
        context.insert(
            "request".to_owned(),
            snapshot::request_value(head, false, true, apm.sanitizer()),
        );

        let transaction = match &self.state {
            State::Open(handle) => Some(handle),
            _ => None,
        };
        let id = apm.report_exception(exception, context, false, transaction);
        debug!(%id, "unhandled error reported");
    }

    /// Tags the transaction with request/response metadata, names and
    /// classifies it, and ends it. Later calls are no-ops.
    pub fn on_success(&mut self, res: &Response) {
        self.close(Some(res));
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    fn close(&mut self, res: Option<&Response>) {
        let handle = match std::mem::replace(&mut self.state, State::Closed) {
            State::Open(handle) => handle,
            State::Idle => {
                self.state = State::Idle;
                return;
            }
            State::Closed => {
                debug!("transaction already closed");
                return;
            }
        };
        let (Some(apm), Some(head)) = (self.apm.as_ref(), self.head.as_ref()) else { return };
        let config = apm.config();

        handle.set_context("request", || {
            snapshot::request(
                head,
                config.capture_body.for_transactions(),
                config.capture_headers,
                apm.sanitizer(),
            )
        });
        handle.set_name(format!("{} {}", head.method, route_name(head)), false);

        match res {
            Some(res) => {
                handle.set_context("response", || {
                    snapshot::response(res, config.capture_headers, apm.sanitizer())
                });
                handle.set_result(classify_result(res.status_code()), false);
            }
            None => debug!("request abandoned before a response was produced"),
        }
        apm.end_transaction(&handle);
    }
}

impl Drop for TransactionAdapter {
    fn drop(&mut self) {
        self.close(None);
    }
}

fn route_name(head: &RequestHead) -> String {
    let path = head.uri.path();
    resolve_route_name(head.route.as_deref(), path).unwrap_or_else(|e| {
        debug!(path, "using raw path as transaction name: {e}");
        path.to_owned()
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use http::Method;

    use super::*;
    use crate::apm::{ApmConfig, CaptureBody, MemoryReporter};
    use crate::request::test_head;

    #[test]
    fn route_names_truncate_to_five_segments() {
        assert_eq!(resolve_route_name(Some("/a/b/c/d/e/f/g"), "/a/b/c/d/e/f/g").unwrap(), "/a/b/c/d/e");
        assert_eq!(resolve_route_name(Some("/a"), "/a").unwrap(), "/a");
        assert_eq!(resolve_route_name(Some("/"), "/").unwrap(), "/");
    }

    #[test]
    fn route_names_drop_trailing_parameters() {
        assert_eq!(
            resolve_route_name(Some("/api/v1/items/{id}"), "/api/v1/items/42").unwrap(),
            "/api/v1/items"
        );
        assert_eq!(
            resolve_route_name(
                Some("/api/v1/users/{id}/orders/{oid}"),
                "/api/v1/users/123/orders/456"
            )
            .unwrap(),
            "/api/v1/users/123/orders"
        );
        assert_eq!(resolve_route_name(Some("/files/{*rest}"), "/files/a/b/c").unwrap(), "/files");
    }

    #[test]
    fn route_name_failures_explain_themselves() {
        assert_eq!(resolve_route_name(None, "/nowhere"), Err(RouteNameError::Unmatched));
        assert!(matches!(
            resolve_route_name(Some("/a/b/c"), "/a"),
            Err(RouteNameError::SegmentMismatch { expected: 3, actual: 1, .. })
        ));
    }

    #[test]
    fn results_are_classified_by_status_class() {
        assert_eq!(classify_result(StatusCode::CREATED), "HTTP 2xx");
        assert_eq!(classify_result(StatusCode::NOT_FOUND), "HTTP 4xx");
        assert_eq!(classify_result(StatusCode::SERVICE_UNAVAILABLE), "HTTP 5xx");
    }

    fn bound(config: ApmConfig) -> (Arc<Apm>, Arc<MemoryReporter>) {
        let reporter = Arc::new(MemoryReporter::new());
        let apm = Arc::new(Apm::new(config, reporter.clone()).unwrap());
        (apm, reporter)
    }

    fn request(apm: &Arc<Apm>, method: Method, uri: &str, route: Option<&str>, body: &'static str) -> Request {
        let mut head = test_head(method, uri, route);
        head.headers.insert("host", "localhost".parse().unwrap());
        head.body = bytes::Bytes::from_static(body.as_bytes());
        Request::new(head, HashMap::new(), Some(Arc::clone(apm)))
    }

    #[test]
    fn success_names_classifies_and_ends() {
        let (apm, reporter) = bound(ApmConfig::default());
        let req = request(&apm, Method::GET, "/api/v1/items/42", Some("/api/v1/items/{id}"), "");
        let mut adapter = TransactionAdapter::new(Some(apm));
        let handle = adapter.prepare(&req).unwrap();

        adapter.on_success(&Response::text("ok"));
        assert!(handle.is_ended());

        let txs = reporter.transactions();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].name(), Some("GET /api/v1/items"));
        assert_eq!(txs[0].result(), Some("HTTP 2xx"));
        assert_eq!(txs[0].category(), REQUEST_CATEGORY);
        assert_eq!(txs[0].context()["response"]["status_code"], 200);
        assert_eq!(txs[0].context()["request"]["method"], "GET");
    }

    #[test]
    fn second_close_is_a_no_op() {
        let (apm, reporter) = bound(ApmConfig::default());
        let req = request(&apm, Method::GET, "/x", Some("/x"), "");
        let mut adapter = TransactionAdapter::new(Some(apm));
        adapter.prepare(&req);
        adapter.on_success(&Response::text("ok"));
        adapter.on_success(&Response::text("ok"));
        drop(adapter);
        assert_eq!(reporter.transactions().len(), 1);
    }

    #[test]
    fn explicit_names_are_not_overridden() {
        let (apm, reporter) = bound(ApmConfig::default());
        let req = request(&apm, Method::GET, "/x", Some("/x"), "");
        let mut adapter = TransactionAdapter::new(Some(apm));
        let handle = adapter.prepare(&req).unwrap();
        handle.set_name("checkout", false);
        adapter.on_success(&Response::text("ok"));
        assert_eq!(reporter.transactions()[0].name(), Some("checkout"));
    }

    #[test]
    fn body_capture_follows_policy() {
        for (policy, expect_body) in [(CaptureBody::Off, false), (CaptureBody::All, true)] {
            let (apm, reporter) = bound(ApmConfig { capture_body: policy, ..ApmConfig::default() });
            let req = request(&apm, Method::POST, "/login", Some("/login"), "user=alice");
            let mut adapter = TransactionAdapter::new(Some(apm));
            adapter.prepare(&req);
            adapter.on_success(&Response::text("ok"));
            let tx = &reporter.transactions()[0];
            assert_eq!(tx.context()["request"].get("body").is_some(), expect_body, "{policy}");
        }
    }

    #[test]
    fn errors_never_carry_the_body() {
        let (apm, reporter) = bound(ApmConfig { capture_body: CaptureBody::All, ..ApmConfig::default() });
        let req = request(&apm, Method::POST, "/login", Some("/login"), "password=x");
        let mut adapter = TransactionAdapter::new(Some(apm));
        let handle = adapter.prepare(&req).unwrap();
        let tx_id = handle.id();

        adapter.on_error(Exception::new("panic", "boom"));
        assert!(!adapter.is_closed());
        adapter.on_success(&Response::status(StatusCode::INTERNAL_SERVER_ERROR));

        let errors = reporter.errors();
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].handled);
        assert_eq!(errors[0].transaction_id, tx_id);
        let request = &errors[0].context["request"];
        assert!(request.get("headers").is_some());
        assert!(request.get("body").is_none());

        let txs = reporter.transactions();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].result(), Some("HTTP 5xx"));
    }

    #[test]
    fn dropped_adapter_still_ends_the_transaction() {
        let (apm, reporter) = bound(ApmConfig::default());
        let req = request(&apm, Method::GET, "/slow", Some("/slow"), "");
        let mut adapter = TransactionAdapter::new(Some(apm));
        adapter.prepare(&req);
        drop(adapter);

        let txs = reporter.transactions();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].name(), Some("GET /slow"));
        assert_eq!(txs[0].result(), None);
    }

    #[test]
    fn unbound_adapter_does_nothing() {
        let req = Request::new(test_head(Method::GET, "/", None), HashMap::new(), None);
        let mut adapter = TransactionAdapter::new(None);
        assert!(adapter.prepare(&req).is_none());
        adapter.on_error(Exception::new("panic", "boom"));
        adapter.on_success(&Response::text("ok"));
        assert!(!adapter.is_closed());
    }

    #[test]
    fn ignored_paths_open_no_transaction() {
        let (apm, reporter) = bound(ApmConfig {
            transaction_ignore_urls: vec!["/healthz".into()],
            ..ApmConfig::default()
        });
        let req = request(&apm, Method::GET, "/healthz", Some("/healthz"), "");
        let mut adapter = TransactionAdapter::new(Some(apm));
        assert!(adapter.prepare(&req).is_none());
        adapter.on_success(&Response::text("ok"));
        assert!(reporter.transactions().is_empty());
    }

    #[test]
    fn unmatched_route_falls_back_to_raw_path() {
        let (apm, reporter) = bound(ApmConfig::default());
        let req = request(&apm, Method::GET, "/no/such/thing", None, "");
        let mut adapter = TransactionAdapter::new(Some(apm));
        adapter.prepare(&req);
        adapter.on_success(&Response::status(StatusCode::NOT_FOUND));
        let tx = &reporter.transactions()[0];
        assert_eq!(tx.name(), Some("GET /no/such/thing"));
        assert_eq!(tx.result(), Some("HTTP 4xx"));
    }
}
