//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Errors that
//! cross a worker boundary travel as a [`WireError`](crate::ipc::WireError) and
//! are rebuilt on the calling side with [`Error::from_wire`], so callers see the
//! same variant no matter which worker raised it.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the Kite runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Router type has no registered service definition.
    #[error("no such service: {0}")]
    UnknownService(String),

    /// Component name resolves neither in the service nor in the registry.
    #[error("no such component: {0}")]
    UnknownComponent(String),

    /// Middleware name resolves neither in the service nor in the registry.
    #[error("no such middleware: {0}")]
    UnknownMiddleware(String),

    /// Dependency graph contains a cycle through the named type.
    #[error("circular dependency detected: {0}")]
    CircularDependency(String),

    /// `next()` invoked more than once from the same middleware step.
    #[error("next() called multiple times")]
    DoubleNext,

    /// Boot-time configuration errors (duplicates, missing dependencies).
    #[error("configuration error: {0}")]
    Config(String),

    /// Lookup failure (method, handler, service instance).
    #[error("not found: {0}")]
    NotFound(String),

    /// Failure raised by author code (setup, hook, handler, timer).
    #[error("handler error: {0}")]
    Handler(String),

    /// Failure reported by a peer worker without a known code.
    #[error("remote error: {0}")]
    Remote(String),

    /// Worker or channel is gone.
    #[error("channel closed: {0}")]
    Closed(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable code used on the wire between workers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::UnknownService(_) => "UNKNOWN_SERVICE",
            Error::UnknownComponent(_) => "UNKNOWN_COMPONENT",
            Error::UnknownMiddleware(_) => "UNKNOWN_MIDDLEWARE",
            Error::CircularDependency(_) => "CIRCULAR_DEPENDENCY",
            Error::DoubleNext => "DOUBLE_NEXT",
            Error::Config(_) => "CONFIG",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Handler(_) => "HANDLER",
            Error::Remote(_) => "REMOTE",
            Error::Closed(_) => "CLOSED",
            Error::Internal(_) => "INTERNAL",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Io(_) => "IO",
        }
    }

    /// Payload of the error without the variant prefix.
    pub fn detail(&self) -> String {
        match self {
            Error::UnknownService(msg)
            | Error::UnknownComponent(msg)
            | Error::UnknownMiddleware(msg)
            | Error::CircularDependency(msg)
            | Error::Config(msg)
            | Error::NotFound(msg)
            | Error::Handler(msg)
            | Error::Remote(msg)
            | Error::Closed(msg)
            | Error::Internal(msg) => msg.clone(),
            Error::DoubleNext => String::new(),
            Error::Serialization(e) => e.to_string(),
            Error::Io(e) => e.to_string(),
        }
    }

    /// Rebuild an error from its wire code and detail.
    ///
    /// Serialization and I/O errors cannot be reconstructed and come back as
    /// `Remote` carrying the original description.
    pub fn from_wire(code: &str, detail: String) -> Self {
        match code {
            "UNKNOWN_SERVICE" => Error::UnknownService(detail),
            "UNKNOWN_COMPONENT" => Error::UnknownComponent(detail),
            "UNKNOWN_MIDDLEWARE" => Error::UnknownMiddleware(detail),
            "CIRCULAR_DEPENDENCY" => Error::CircularDependency(detail),
            "DOUBLE_NEXT" => Error::DoubleNext,
            "CONFIG" => Error::Config(detail),
            "NOT_FOUND" => Error::NotFound(detail),
            "HANDLER" => Error::Handler(detail),
            "CLOSED" => Error::Closed(detail),
            "INTERNAL" => Error::Internal(detail),
            _ => Error::Remote(detail),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn unknown_service(name: impl Into<String>) -> Self {
        Self::UnknownService(name.into())
    }

    pub fn unknown_component(name: impl Into<String>) -> Self {
        Self::UnknownComponent(name.into())
    }

    pub fn unknown_middleware(name: impl Into<String>) -> Self {
        Self::UnknownMiddleware(name.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip_keeps_variant() {
        let err = Error::unknown_service("echo");
        let rebuilt = Error::from_wire(err.code(), err.detail());
        assert!(matches!(rebuilt, Error::UnknownService(ref name) if name == "echo"));
        assert_eq!(rebuilt.to_string(), "no such service: echo");
    }

    #[test]
    fn test_double_next_round_trip() {
        let rebuilt = Error::from_wire(Error::DoubleNext.code(), Error::DoubleNext.detail());
        assert!(matches!(rebuilt, Error::DoubleNext));
    }

    #[test]
    fn test_unknown_code_becomes_remote() {
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let rebuilt = Error::from_wire(io.code(), io.detail());
        assert!(matches!(rebuilt, Error::Remote(ref msg) if msg == "disk gone"));
    }
}
