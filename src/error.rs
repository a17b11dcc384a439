//! Unified error type.

/// The error type returned by tsu's fallible operations.
///
/// Application-level errors (404, 422, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values, not as `Error`s. This type surfaces
/// infrastructure failures (binding a port, accepting a connection) and
/// misuse of the APM layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Instrumentation could not be bound: invalid settings, or the
    /// application already carries a client handle.
    #[error("apm configuration: {0}")]
    Configuration(String),

    /// An APM operation was used before the application was instrumented.
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
