//! HTTP server, request dispatch, and graceful shutdown.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! The server reacts by:
//! 1. Immediately stopping `listener.accept()`, so no new connections are made.
//! 2. Letting every in-flight connection task run to completion.
//! 3. Returning from [`Server::serve`], which lets `main` exit cleanly.
//!
//! Every request finishing during the drain still closes its APM
//! transaction before the connection is released.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, error, info, info_span, warn};

use crate::apm::{Exception, TransactionAdapter, hooks};
use crate::error::Error;
use crate::request::{Request, RequestHead};
use crate::response::Response;
use crate::router::Router;

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid `host:port` string.
    pub fn bind(addr: &str) -> Self {
        let addr: SocketAddr = addr.parse().expect("invalid socket address");
        Self { addr }
    }

    /// Starts accepting connections and dispatching them through `router`.
    ///
    /// Returns only after a full graceful shutdown (SIGTERM or Ctrl-C,
    /// followed by all in-flight requests completing).
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        self.serve_with_shutdown(router, shutdown_signal()).await
    }

    /// Like [`serve`](Server::serve), but drains on `signal` instead of
    /// process signals.
    pub async fn serve_with_shutdown<S>(self, router: Router, signal: S) -> Result<(), Error>
    where
        S: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.addr).await?;
        Self::serve_listener(listener, router, signal).await
    }

    /// Serves on an already bound listener until `signal` resolves.
    pub async fn serve_listener<S>(listener: TcpListener, router: Router, signal: S) -> Result<(), Error>
    where
        S: Future<Output = ()>,
    {
        // Shared by every connection task without copying the routing table.
        let router = Arc::new(router);
        info!(addr = %listener.local_addr()?, instrumented = router.apm().is_ok(), "tsu listening");

        // Tracks every connection task so shutdown can wait for them.
        let mut tasks = tokio::task::JoinSet::new();
        // Polled repeatedly across loop iterations, so it must stay put.
        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Arms are checked top to bottom. Shutdown comes first so a
                // signal stops accepting even while connections are queued.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    // Adapts tokio's AsyncRead/AsyncWrite to hyper's IO traits.
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // The closure runs once per request on the connection,
                        // not once per connection.
                        let svc = service_fn(move |req| {
                            let router = Arc::clone(&router);
                            async move { dispatch(router, req, remote_addr).await }
                        });

                        // Serves HTTP/1.1 or HTTP/2, whichever the client speaks.
                        // A client that hangs up mid-request drops `dispatch`.
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the set stays bounded on
                // long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        // Drain: every in-flight connection finishes before we return.
        while tasks.join_next().await.is_some() {}

        info!("tsu stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Routes one request and produces one response. Never fails: body errors,
/// misses and handler panics all become HTTP responses.
pub(crate) async fn dispatch<B>(
    router: Arc<Router>,
    req: http::Request<B>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, Infallible>
where
    B: Body + Send,
    B::Data: Send,
    B::Error: fmt::Display,
{
    let span = info_span!("request", method = %req.method(), path = %req.uri().path());
    let response = handle(router, req, remote_addr).instrument(span).await;
    Ok(response.into_inner())
}

async fn handle<B>(router: Arc<Router>, req: http::Request<B>, remote_addr: SocketAddr) -> Response
where
    B: Body + Send,
    B::Data: Send,
    B::Error: fmt::Display,
{
    let (parts, body) = req.into_parts();

    let matched = router.lookup(&parts.method, parts.uri.path());
    let (handler, params, route) = match matched {
        Some(m) => (Some(m.handler), m.params, Some(m.template)),
        None => (None, HashMap::new(), None),
    };

    let head = RequestHead {
        method: parts.method,
        uri: parts.uri,
        version: parts.version,
        headers: parts.headers,
        body: Bytes::new(),
        route,
        remote_addr,
    };
    let apm = router.apm().ok().cloned();
    let mut request = Request::new(head, params, apm.clone());

    // Opened before the body is read so that requests with unreadable
    // bodies are still recorded. Lives until this future completes or is
    // dropped; either way it closes the transaction.
    let mut adapter = TransactionAdapter::new(apm);
    if let Some(transaction) = adapter.prepare(&request) {
        request.attach_transaction(transaction);
    }

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(peer = %remote_addr, "failed to read request body: {e}");
            let response = Response::status(StatusCode::BAD_REQUEST);
            adapter.on_success(&response);
            return response;
        }
    };
    adapter.attach_body(body.clone());
    request.set_body(body);

    let response = match handler {
        Some(handler) => {
            // Own task, so a panicking handler cannot take the connection
            // down with it. The guard aborts the task if this future is
            // dropped first.
            let task = hooks::request_scope(handler.call(request)).in_current_span();
            let task = AbortOnDrop(tokio::spawn(task));
            match task.join().await {
                Ok(response) => response,
                Err(e) => {
                    let exception = if e.is_panic() {
                        Exception::from_panic(&*e.into_panic())
                    } else {
                        Exception::new("cancelled", e.to_string())
                    };
                    error!(%exception, "handler failed");
                    adapter.on_error(exception);
                    Response::status(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
        None => Response::status(StatusCode::NOT_FOUND),
    };

    adapter.on_success(&response);
    response
}

/// Aborts the handler task when the request is abandoned, so no handler
/// work outlives the request's transaction.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    async fn join(mut self) -> Result<T, JoinError> {
        (&mut self.0).await
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on SIGTERM or SIGINT (Unix), or Ctrl-C elsewhere.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apm::{ApmConfig, Binder, MemoryReporter};

    async fn item(req: Request) -> Response {
        Response::text(req.param("id").unwrap_or_default().to_owned())
    }

    async fn boom(_req: Request) -> Response {
        panic!("handler exploded")
    }

    fn instrumented(router: Router) -> (Arc<Router>, Arc<MemoryReporter>) {
        let mut router = router;
        let reporter = Arc::new(MemoryReporter::new());
        let config = ApmConfig { instrument: false, ..ApmConfig::default() };
        let apm = Arc::new(crate::apm::Apm::new(config, reporter.clone()).unwrap());
        Binder::new().client(apm).bind(&mut router).unwrap();
        (Arc::new(router), reporter)
    }

    fn get(uri: &str) -> http::Request<Full<Bytes>> {
        http::Request::get(uri)
            .header("host", "localhost")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    #[tokio::test]
    async fn dispatch_records_one_named_transaction() {
        let (router, reporter) = instrumented(Router::new().get("/api/v1/items/{id}", item));
        let res = dispatch(router, get("/api/v1/items/42"), peer()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let txs = reporter.transactions();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].name(), Some("GET /api/v1/items"));
        assert_eq!(txs[0].result(), Some("HTTP 2xx"));
    }

    #[tokio::test]
    async fn handler_panic_becomes_500_and_an_unhandled_error() {
        let (router, reporter) = instrumented(Router::new().get("/boom", boom));
        let res = dispatch(router, get("/boom"), peer()).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let errors = reporter.errors();
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].handled);
        assert_eq!(errors[0].exception.message, "handler exploded");

        let txs = reporter.transactions();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].result(), Some("HTTP 5xx"));
        assert_eq!(Some(txs[0].id()), errors[0].transaction_id);
    }

    #[tokio::test]
    async fn unmatched_paths_are_named_by_raw_path() {
        let (router, reporter) = instrumented(Router::new());
        let res = dispatch(router, get("/nope/1"), peer()).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(reporter.transactions()[0].name(), Some("GET /nope/1"));
    }

    static SLOW_HANDLER_RESUMED: std::sync::atomic::AtomicBool =
        std::sync::atomic::AtomicBool::new(false);

    async fn slow_then_panic(_req: Request) -> Response {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        SLOW_HANDLER_RESUMED.store(true, std::sync::atomic::Ordering::SeqCst);
        panic!("too late")
    }

    #[tokio::test]
    async fn abandoned_request_stops_its_handler() {
        let (router, reporter) = instrumented(Router::new().get("/slow", slow_then_panic));
        let dropped = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            dispatch(router, get("/slow"), peer()),
        )
        .await;
        assert!(dropped.is_err());
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert!(!SLOW_HANDLER_RESUMED.load(std::sync::atomic::Ordering::SeqCst));
        let txs = reporter.transactions();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].name(), Some("GET /slow"));
        assert_eq!(txs[0].result(), None);
        assert!(reporter.errors().is_empty());
    }

    struct BrokenBody;

    impl Body for BrokenBody {
        type Data = Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Result<hyper::body::Frame<Bytes>, Self::Error>>> {
            let e = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "client went away");
            std::task::Poll::Ready(Some(Err(e)))
        }
    }

    #[tokio::test]
    async fn unreadable_body_is_still_a_transaction() {
        let (router, reporter) = instrumented(Router::new().post("/upload", item));
        let req = http::Request::post("/upload")
            .header("host", "localhost")
            .body(BrokenBody)
            .unwrap();
        let res = dispatch(router, req, peer()).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let txs = reporter.transactions();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].name(), Some("POST /upload"));
        assert_eq!(txs[0].result(), Some("HTTP 4xx"));
    }

    #[tokio::test]
    async fn uninstrumented_router_still_serves() {
        let router = Arc::new(Router::new().get("/items/{id}", item));
        let res = dispatch(router, get("/items/7"), peer()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reporter_failure_does_not_change_the_response() {
        let (router, reporter) = instrumented(Router::new().get("/items/{id}", item));
        reporter.set_failing(true);
        let res = dispatch(router, get("/items/7"), peer()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(reporter.reports().is_empty());
    }
}
