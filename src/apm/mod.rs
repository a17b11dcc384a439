//! APM instrumentation.
//!
//! [`Binder`] attaches one [`Apm`] client handle to an application at
//! startup. From then on every request dispatched by the server goes
//! through a [`TransactionAdapter`]: a `"request"` transaction is opened
//! before the handler runs and, once the response status is known, tagged
//! with request/response metadata, named after its route, classified by
//! status class, and handed to the [`Reporter`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tsu_apm::apm::{Binder, Settings};
//! use tsu_apm::{Request, Response, Router, Server};
//!
//! # async fn get_item(_: Request) -> Response { Response::text("") }
//! #[tokio::main]
//! async fn main() -> Result<(), tsu_apm::Error> {
//!     let mut app = Router::new()
//!         .get("/api/v1/items/{id}", get_item)
//!         .settings(Settings::from_env()?);
//!
//!     let apm = Binder::new().bind(&mut app)?;
//!     apm.capture_message("service starting");
//!
//!     Server::bind("0.0.0.0:3000").serve(app).await
//! }
//! ```
//!
//! Instrumentation never fails a request: metadata that cannot be extracted
//! degrades to a fallback value, and reporter errors are logged and dropped.

mod adapter;
mod client;
mod config;
pub(crate) mod hooks;
mod report;
pub(crate) mod snapshot;
mod transaction;

use std::sync::Arc;

use tracing::info;

use crate::error::Error;
use crate::router::Router;

pub use adapter::{
    MAX_ROUTE_SEGMENTS, REQUEST_CATEGORY, RouteNameError, TransactionAdapter, classify_result,
    resolve_route_name,
};
pub use client::Apm;
pub use config::{ApmConfig, CaptureBody, Settings};
pub use report::{
    ChannelReporter, ErrorEvent, Exception, MemoryReporter, MessageEvent, Report, ReportError,
    Reporter, TracingReporter,
};
pub use transaction::{Context, Transaction, TransactionHandle};

const FRAMEWORK_NAME: &str = "tsu";
const FRAMEWORK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One-time setup attaching a client handle to an application.
#[derive(Default)]
pub struct Binder {
    client: Option<Arc<Apm>>,
    reporter: Option<Arc<dyn Reporter>>,
    framework: Option<(String, String)>,
}

impl Binder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing client handle instead of building one from the
    /// application's settings.
    pub fn client(mut self, client: Arc<Apm>) -> Self {
        self.client = Some(client);
        self
    }

    /// Backend for the handle built at bind time. Defaults to
    /// [`TracingReporter`].
    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Framework identity used when the settings leave it unset.
    pub fn framework(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.framework = Some((name.into(), version.into()));
        self
    }

    /// Builds (or takes) the client handle, installs the global hook when
    /// `instrument` is on, and publishes the handle into `app`.
    ///
    /// Fails with [`Error::Configuration`] if `app` is already instrumented
    /// or its `APM` settings are invalid.
    pub fn bind(self, app: &mut Router) -> Result<Arc<Apm>, Error> {
        if app.apm_slot().is_some() {
            return Err(Error::config("application is already instrumented"));
        }

        let client = match self.client {
            Some(client) => client,
            None => {
                let mut config = app.settings_ref().apm.clone().unwrap_or_default();
                let (name, version) = self.framework.unwrap_or_else(|| {
                    (FRAMEWORK_NAME.to_owned(), FRAMEWORK_VERSION.to_owned())
                });
                config.framework_name.get_or_insert(name);
                config.framework_version.get_or_insert(version);
                let reporter = self.reporter
                    .unwrap_or_else(|| Arc::new(TracingReporter) as Arc<dyn Reporter>);
                Arc::new(Apm::new(config, reporter)?)
            }
        };

        let config = client.config();
        if config.instrument && hooks::install(&client) {
            info!("apm panic hook installed");
        }
        info!(
            service = %config.service_name,
            framework = config.framework_name.as_deref().unwrap_or(FRAMEWORK_NAME),
            capture_body = %config.capture_body,
            capture_headers = config.capture_headers,
            "apm bound"
        );

        app.publish_apm(Arc::clone(&client));
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(json: &str) -> Settings {
        Settings::from_json(json).unwrap()
    }

    #[test]
    fn bind_reads_the_apm_settings_key() {
        let mut app = Router::new().settings(settings(
            r#"{"APM": {"service_name": "shop", "instrument": false, "capture_body": "all"}}"#,
        ));
        let apm = Binder::new().reporter(Arc::new(MemoryReporter::new())).bind(&mut app).unwrap();
        assert_eq!(apm.config().service_name, "shop");
        assert_eq!(apm.config().capture_body, CaptureBody::All);
        assert_eq!(apm.config().framework_name.as_deref(), Some(FRAMEWORK_NAME));
        assert_eq!(apm.config().framework_version.as_deref(), Some(FRAMEWORK_VERSION));
        assert!(Arc::ptr_eq(app.apm().unwrap(), &apm));
    }

    #[test]
    fn settings_win_over_framework_defaults() {
        let mut app = Router::new().settings(settings(
            r#"{"APM": {"instrument": false, "framework_name": "custom"}}"#,
        ));
        let apm = Binder::new().framework("other", "9.9").bind(&mut app).unwrap();
        assert_eq!(apm.config().framework_name.as_deref(), Some("custom"));
        assert_eq!(apm.config().framework_version.as_deref(), Some("9.9"));
    }

    #[test]
    fn injected_client_is_used_as_is() {
        let config = ApmConfig { instrument: false, ..ApmConfig::default() };
        let client = Arc::new(Apm::new(config, Arc::new(MemoryReporter::new())).unwrap());
        let mut app = Router::new();
        let bound = Binder::new().client(Arc::clone(&client)).bind(&mut app).unwrap();
        assert!(Arc::ptr_eq(&bound, &client));
    }

    #[test]
    fn binding_twice_is_a_configuration_error() {
        let mut app = Router::new().settings(settings(r#"{"APM": {"instrument": false}}"#));
        Binder::new().bind(&mut app).unwrap();
        assert!(matches!(Binder::new().bind(&mut app), Err(Error::Configuration(_))));
    }

    #[test]
    fn invalid_settings_abort_binding() {
        let mut app = Router::new()
            .settings(settings(r#"{"APM": {"service_name": "bad/name", "instrument": false}}"#));
        assert!(matches!(Binder::new().bind(&mut app), Err(Error::Configuration(_))));
        assert!(app.apm().is_err());
    }
}
