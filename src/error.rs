//! Error handling for tidal-session.
//!
//! Provides a single error type whose [`ErrorKind`] tells callers what they
//! can do about a failure:
//!
//! * Fix their setup ([`ErrorKind::Configuration`])
//! * Restart the interactive login ([`ErrorKind::Protocol`],
//!   [`ErrorKind::AuthorizationFailed`], [`ErrorKind::ReauthenticationRequired`],
//!   [`ErrorKind::NotAuthenticated`])
//! * Retry later ([`ErrorKind::Transient`])
//!
//! # Example
//!
//! ```rust
//! use tidal_session::error::{Error, ErrorKind, Result};
//!
//! async fn token(session: &SessionManager) -> Result<String> {
//!     match session.access_token().await {
//!         Err(e) if e.kind == ErrorKind::ReauthenticationRequired => {
//!             // send the user through the web view again
//!             Err(e)
//!         }
//!         other => other,
//!     }
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
///
/// Provides:
/// * Categorized error types ([`ErrorKind`])
/// * Underlying error details
/// * Conversion from common error types
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// # Example
    /// ```
    /// if let Some(e) = error.downcast::<reqwest::Error>() {
    ///     println!("HTTP status: {:?}", e.status());
    /// }
    /// ```
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Whether the operation that failed may succeed when tried again
    /// without user interaction.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Standard result type for tidal-session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories of the authentication flow.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// Malformed or missing client identity or settings. Not retryable.
    #[error("configuration error")]
    Configuration,

    /// Malformed redirect URL, or missing or mismatched `code` or `state`.
    /// The caller must restart the authorization.
    #[error("protocol error")]
    Protocol,

    /// The authorization code was rejected (invalid, expired or reused).
    #[error("authorization failed")]
    AuthorizationFailed,

    /// The refresh token was rejected or revoked. Only a new interactive
    /// login can recover from this.
    #[error("reauthentication required")]
    ReauthenticationRequired,

    /// Network failure, timeout or server error. State is left unchanged
    /// and the operation can be retried.
    #[error("transient error")]
    Transient,

    /// No tokens have been obtained yet.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The REST API rejected an authorized request for a reason other than
    /// an expired token.
    #[error("api request rejected")]
    Api,

    /// Broken internal invariant.
    #[error("internal error")]
    Internal,
}

impl Error {
    /// Creates a new error with specified kind and details.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::new(ErrorKind::Protocol, "redirect has no code");
    /// assert_eq!(err.kind, ErrorKind::Protocol);
    /// ```
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Creates an error for malformed or missing configuration.
    pub fn configuration<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Configuration, error)
    }

    /// Creates an error for a redirect or response that does not follow the
    /// OAuth protocol.
    pub fn protocol<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Protocol, error)
    }

    /// Creates an error for an authorization code that the server rejected.
    pub fn authorization_failed<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::AuthorizationFailed, error)
    }

    /// Creates an error for a refresh token that the server rejected.
    pub fn reauthentication_required<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::ReauthenticationRequired, error)
    }

    /// Creates an error for failures that are safe to retry.
    ///
    /// Use when:
    /// * The network connection failed or was reset
    /// * A request timed out
    /// * The server answered with a 5xx status
    pub fn transient<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Transient, error)
    }

    /// Creates an error for token requests before any login.
    pub fn not_authenticated<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::NotAuthenticated, error)
    }

    /// Creates an error for an authorized request the REST API rejected.
    pub fn api<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Api, error)
    }

    /// Creates an error for internal errors that shouldn't occur during
    /// normal operation.
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }
}

/// Returns the underlying error source.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error for display, showing both kind and details.
///
/// Format: "{kind}: {details}"
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts HTTP client errors into appropriate error kinds.
///
/// Anything that went wrong on the wire is transient. Builder errors come
/// from bad endpoints or header values in the configuration.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return Self::configuration(err);
        }

        if err.is_decode() {
            return Self::protocol(err);
        }

        Self::transient(err)
    }
}

/// Converts I/O errors from reading secrets files to `Configuration`.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::configuration(err)
    }
}

/// Converts JSON errors from unexpected response bodies to `Protocol`.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::protocol(err)
    }
}

/// Converts TOML errors from secrets files to `Configuration`.
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(err)
    }
}

/// Converts URL parsing errors to `Configuration`.
///
/// Redirect URLs are parsed explicitly and mapped to `Protocol` instead.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::configuration(e.to_string())
    }
}

/// Converts invalid header errors to `Configuration`.
impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::configuration(e.to_string())
    }
}

/// Converts header size errors to `Internal`.
impl From<http::header::MaxSizeReached> for Error {
    fn from(e: http::header::MaxSizeReached) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts failed background tasks to `Internal`.
impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts poisoned mutex errors to `Internal`.
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::internal(e.to_string())
    }
}
