//! # tsu-apm
//!
//! A minimal HTTP framework for Rust services behind a reverse proxy, with
//! APM transaction instrumentation built into the request lifecycle.
//!
//! ## The contract
//!
//! nginx handles TLS, rate limiting, slow clients, and body-size limits.
//! tsu does routing, async I/O, graceful shutdown, and one more thing every
//! production service ends up bolting on: recording each request as a
//! monitored transaction.
//!
//! - Radix-tree routing via [`matchit`], with route templates kept for naming
//! - hyper HTTP/1.1 and HTTP/2 on tokio
//! - Graceful shutdown on SIGTERM / Ctrl-C, draining in-flight requests
//! - [`apm`]: one transaction per request, named `"GET /api/v1/items"`,
//!   classified `"HTTP 2xx"`, closed exactly once on every path
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use http::StatusCode;
//! use tsu_apm::apm::{Binder, Settings};
//! use tsu_apm::{Request, Response, Router, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tsu_apm::Error> {
//!     let mut app = Router::new()
//!         .get("/users/{id}", get_user)
//!         .post("/users", create_user)
//!         .settings(Settings::from_json(r#"{"APM": {"service_name": "users"}}"#)?);
//!
//!     Binder::new().bind(&mut app)?;
//!     Server::bind("0.0.0.0:3000").serve(app).await
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#).into_bytes())
//! }
//!
//! async fn create_user(req: Request) -> Response {
//!     if req.body().is_empty() {
//!         return Response::status(StatusCode::BAD_REQUEST);
//!     }
//!     Response::builder()
//!         .status(StatusCode::CREATED)
//!         .header("location", "/users/99")
//!         .json(br#"{"id":"99"}"#.to_vec())
//! }
//! ```

mod error;
mod handler;
mod request;
mod response;
mod router;
mod server;

pub mod apm;

pub use error::Error;
pub use handler::Handler;
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;
