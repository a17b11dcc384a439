//! Incoming HTTP request type.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};
use uuid::Uuid;

use crate::apm::{Apm, Context, Exception, TransactionHandle, snapshot};
use crate::error::Error;

const NOT_CONFIGURED: &str = "capture called before application configured";

/// The parts of a request the APM adapter needs after the handler has
/// consumed the [`Request`] itself. Cheap to clone: the body is refcounted.
#[derive(Clone, Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) route: Option<Arc<str>>,
    pub(crate) remote_addr: SocketAddr,
}

/// An incoming HTTP request with its body fully collected.
pub struct Request {
    head: RequestHead,
    params: HashMap<String, String>,
    apm: Option<Arc<Apm>>,
    transaction: Option<TransactionHandle>,
}

impl Request {
    pub(crate) fn new(
        head: RequestHead,
        params: HashMap<String, String>,
        apm: Option<Arc<Apm>>,
    ) -> Self {
        Self { head, params, apm, transaction: None }
    }

    pub(crate) fn head(&self) -> &RequestHead { &self.head }

    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.head.body = body;
    }

    pub(crate) fn attach_transaction(&mut self, transaction: TransactionHandle) {
        self.transaction = Some(transaction);
    }

    pub fn method(&self) -> &Method { &self.head.method }
    pub fn uri(&self) -> &Uri { &self.head.uri }
    pub fn path(&self) -> &str { self.head.uri.path() }
    pub fn headers(&self) -> &HeaderMap { &self.head.headers }
    pub fn body(&self) -> &[u8] { &self.head.body }
    pub fn remote_addr(&self) -> SocketAddr { self.head.remote_addr }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The route template this request matched, e.g. `/users/{id}`.
    pub fn route(&self) -> Option<&str> {
        self.head.route.as_deref()
    }

    /// The transaction recording this request, if the application is
    /// instrumented and the path is not ignored.
    ///
    /// Names and results set here win over the ones the adapter derives,
    /// since the adapter never overrides.
    pub fn transaction(&self) -> Option<&TransactionHandle> {
        self.transaction.as_ref()
    }

    /// The application's client handle.
    pub fn apm(&self) -> Result<&Arc<Apm>, Error> {
        self.apm.as_ref().ok_or(Error::InvariantViolation(NOT_CONFIGURED))
    }

    /// Reports a handled exception with this request's headers attached,
    /// linked to the current transaction. The body is attached when
    /// `capture_body` is `errors` or `all`.
    pub fn capture_exception(&self, exception: Exception) -> Result<Uuid, Error> {
        let apm = self.apm()?;
        let mut context = Context::new();
        context.insert(
            "request".to_owned(),
            snapshot::request_value(
                &self.head,
                apm.config().capture_body.for_errors(),
                true,
                apm.sanitizer(),
            ),
        );
        Ok(apm.report_exception(exception, context, true, self.transaction.as_ref()))
    }

    /// Reports a free-form message linked to the current transaction.
    pub fn capture_message(&self, message: impl Into<String>) -> Result<Uuid, Error> {
        let apm = self.apm()?;
        Ok(apm.report_message(message.into(), self.transaction.as_ref()))
    }
}

#[cfg(test)]
pub(crate) fn test_head(method: Method, uri: &str, route: Option<&str>) -> RequestHead {
    RequestHead {
        method,
        uri: uri.parse().expect("test uri"),
        version: Version::HTTP_11,
        headers: HeaderMap::new(),
        body: Bytes::new(),
        route: route.map(Arc::from),
        remote_addr: SocketAddr::from(([127, 0, 0, 1], 40000)),
    }
}
