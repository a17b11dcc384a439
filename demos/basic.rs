//! Minimal instrumented service: CRUD-style JSON endpoints, with every
//! request reported as an APM transaction through the tracing reporter.
//!
//! Run with:
//!   RUST_LOG=info APM_SERVICE_NAME=users APM_CAPTURE_BODY=all cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users -d '{"name":"alice"}'
//!   curl -X DELETE http://localhost:3000/users/42
//!   curl http://localhost:3000/users/42/fail

use http::StatusCode;
use tsu_apm::apm::{Binder, Settings};
use tsu_apm::{Request, Response, Router, Server};

#[tokio::main]
async fn main() -> Result<(), tsu_apm::Error> {
    tracing_subscriber::fmt::init();

    let mut app = Router::new()
        .get("/users/{id}", get_user)
        .post("/users", create_user)
        .delete("/users/{id}", delete_user)
        .get("/users/{id}/fail", fail)
        .settings(Settings::from_env()?);

    let apm = Binder::new().bind(&mut app)?;
    apm.capture_message("users service starting");

    Server::bind("0.0.0.0:3000").serve(app).await
}

// GET /users/{id}  →  transaction "GET /users"
async fn get_user(req: Request) -> Response {
    let id = req.param("id").unwrap_or("unknown");
    Response::json(format!(r#"{{"id":"{id}","name":"alice"}}"#).into_bytes())
}

// POST /users  →  transaction "POST /users", result "HTTP 2xx" or "HTTP 4xx"
async fn create_user(req: Request) -> Response {
    if req.body().is_empty() {
        return Response::status(StatusCode::BAD_REQUEST);
    }
    Response::builder()
        .status(StatusCode::CREATED)
        .header("location", "/users/99")
        .json(br#"{"id":"99","name":"new_user"}"#.to_vec())
}

async fn delete_user(req: Request) -> Response {
    if let Some(tx) = req.transaction() {
        tx.set_context("deleted", || req.param("id").map(str::to_owned));
    }
    Response::status(StatusCode::NO_CONTENT)
}

// Panics become a 500 and an unhandled-error report.
async fn fail(_req: Request) -> Response {
    panic!("simulated failure")
}
