//! Error types and error handling strategy for vncd.
//!
//! Errors are explicit and typed. Each error carries a [`ErrorKind`], an
//! optional context string, and an optional source error; per-connection and
//! per-task failures are logged by the server loop and never tear down the
//! daemon.

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid input to `add`/`submit` or to configuration validation.
    BadArgument,
    /// Port outside `1..=65535`.
    BadPort,
    /// Illegal connection state transition.
    BadState,
    /// A required environment variable is unset at session-launch time.
    ConfigMissing,
    /// An operating-system call failed.
    Io,
}

impl ErrorKind {
    /// Returns a human-readable name for the kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::BadArgument => "bad argument",
            Self::BadPort => "bad port",
            Self::BadState => "bad state",
            Self::ConfigMissing => "missing configuration",
            Self::Io => "i/o error",
        }
    }
}

/// The main error type for vncd operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Shorthand for a `BadState` error naming the offending transition.
    #[must_use]
    pub fn bad_state(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadState).with_context(what)
    }

    /// Shorthand for a `ConfigMissing` error naming the variable.
    #[must_use]
    pub fn missing_env(var: &str) -> Self {
        Self::new(ErrorKind::ConfigMissing).with_context(format!("{var} is not set"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.name())?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io).with_source(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Self::new(ErrorKind::Io).with_source(e)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for vncd operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::BadPort);
        assert_eq!(err.to_string(), "bad port");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::BadState).with_context("process on initial connection");
        assert_eq!(err.to_string(), "bad state: process on initial connection");
    }

    #[test]
    fn source_chain_is_exposed() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err = Error::new(ErrorKind::Io).with_context("relay").with_source(io);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "pipe gone");
    }

    #[test]
    fn from_io_error() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err: Error = io.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn result_ext_adds_context() {
        let res: core::result::Result<(), std::io::Error> =
            Err(std::io::Error::from(std::io::ErrorKind::WouldBlock));
        let err = res.context("registration failed").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().starts_with("i/o error: registration failed"));
    }

    #[test]
    fn missing_env_names_variable() {
        let err = Error::missing_env("VNCD_SERVER");
        assert_eq!(err.kind(), ErrorKind::ConfigMissing);
        assert_eq!(err.to_string(), "missing configuration: VNCD_SERVER is not set");
    }
}
