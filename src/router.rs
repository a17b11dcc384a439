//! Radix-tree request router.
//!
//! One tree per HTTP method, O(path-length) lookup. Every entry remembers
//! the template it was registered under so transactions can be named after
//! the route rather than the raw, high-cardinality path.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;
use uuid::Uuid;

use crate::apm::{Apm, Context, Exception, Settings};
use crate::error::Error;
use crate::handler::{BoxedHandler, Handler};

struct Route {
    template: Arc<str>,
    handler: BoxedHandler,
}

pub(crate) struct RouteMatch {
    pub(crate) handler: BoxedHandler,
    pub(crate) params: HashMap<String, String>,
    pub(crate) template: Arc<str>,
}

/// The application: route table, settings store, and the slot the APM
/// binder publishes its client handle into.
///
/// Build it once at startup; pass it to [`Server::serve`](crate::Server::serve).
pub struct Router {
    routes: HashMap<Method, MatchitRouter<Route>>,
    settings: Settings,
    apm: Option<Arc<Apm>>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new(), settings: Settings::default(), apm: None }
    }

    /// Register a handler for a method + path pair. Returns `self` for chaining.
    ///
    /// Path parameters use `{name}` syntax, catch-alls `{*name}`.
    ///
    /// # Panics
    ///
    /// Panics if the template is invalid or conflicts with an existing route.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        let route = Route { template: Arc::from(path), handler: handler.into_boxed_handler() };
        self.routes
            .entry(method)
            .or_default()
            .insert(path, route)
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self { self.on(Method::GET, path, handler) }
    pub fn post(self, path: &str, handler: impl Handler) -> Self { self.on(Method::POST, path, handler) }
    pub fn put(self, path: &str, handler: impl Handler) -> Self { self.on(Method::PUT, path, handler) }
    pub fn patch(self, path: &str, handler: impl Handler) -> Self { self.on(Method::PATCH, path, handler) }
    pub fn delete(self, path: &str, handler: impl Handler) -> Self { self.on(Method::DELETE, path, handler) }

    /// Replace the application settings store.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub(crate) fn settings_ref(&self) -> &Settings { &self.settings }

    pub(crate) fn apm_slot(&self) -> Option<&Arc<Apm>> { self.apm.as_ref() }

    pub(crate) fn publish_apm(&mut self, apm: Arc<Apm>) {
        self.apm = Some(apm);
    }

    /// The bound client handle.
    pub fn apm(&self) -> Result<&Arc<Apm>, Error> {
        self.apm.as_ref().ok_or(Error::InvariantViolation(
            "capture called before application configured",
        ))
    }

    /// Manual exception report outside any request.
    pub fn capture_exception(
        &self,
        exception: Exception,
        context: Context,
        handled: bool,
    ) -> Result<Uuid, Error> {
        Ok(self.apm()?.capture_exception(exception, context, handled))
    }

    /// Manual message report outside any request.
    pub fn capture_message(&self, message: impl Into<String>) -> Result<Uuid, Error> {
        Ok(self.apm()?.capture_message(message))
    }

    pub(crate) fn lookup(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let tree = self.routes.get(method)?;
        let matched = tree.at(path).ok()?;
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some(RouteMatch {
            handler: Arc::clone(&matched.value.handler),
            params,
            template: Arc::clone(&matched.value.template),
        })
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Response;

    async fn ok(_req: crate::Request) -> Response { Response::text("ok") }

    #[test]
    fn lookup_returns_template_and_params() {
        let router = Router::new().get("/users/{id}/orders/{oid}", ok);
        let m = router.lookup(&Method::GET, "/users/7/orders/9").unwrap();
        assert_eq!(&*m.template, "/users/{id}/orders/{oid}");
        assert_eq!(m.params.get("id").map(String::as_str), Some("7"));
        assert_eq!(m.params.get("oid").map(String::as_str), Some("9"));
    }

    #[test]
    fn lookup_is_per_method() {
        let router = Router::new().post("/login", ok);
        assert!(router.lookup(&Method::GET, "/login").is_none());
        assert!(router.lookup(&Method::POST, "/login").is_some());
    }

    #[test]
    fn manual_capture_requires_binding() {
        let router = Router::new();
        assert!(matches!(router.capture_message("x"), Err(Error::InvariantViolation(_))));
    }
}
