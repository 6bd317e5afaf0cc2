//! Error types for the directive pipeline.
//!
//! Every collaborator, handler, and backend in this crate reports failures
//! through [`Error`].  The chat controller additionally classifies backend
//! failures into a [`BackendFailure`], which carries the fixed user-facing
//! string shown in place of a reply.

use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;
use std::sync::Arc;

/// The main error type for the directive pipeline.
#[derive(Clone, Debug)]
pub enum Error {
    /// A generic API error occurred.
    Api {
        /// HTTP status code.
        status_code: u16,
        /// Error type string from the API.
        error_type: Option<String>,
        /// Human-readable error message.
        message: String,
    },

    /// Authentication error.
    Authentication {
        /// Human-readable error message.
        message: String,
    },

    /// Authorization/Permission error.
    Permission {
        /// Human-readable error message.
        message: String,
    },

    /// Resource not found.
    NotFound {
        /// Human-readable error message.
        message: String,
        /// Resource type.
        resource_type: Option<String>,
    },

    /// Rate limit exceeded.
    RateLimit {
        /// Human-readable error message.
        message: String,
        /// Time to wait before retrying, in seconds.
        retry_after: Option<u64>,
    },

    /// The account's quota is exhausted.
    Quota {
        /// Human-readable error message.
        message: String,
    },

    /// The backend refused to answer because of a safety filter.
    SafetyFilter {
        /// Human-readable error message.
        message: String,
    },

    /// Bad request due to invalid parameters.
    BadRequest {
        /// Human-readable error message.
        message: String,
        /// Parameter that caused the error.
        param: Option<String>,
    },

    /// Timeout error.
    Timeout {
        /// Human-readable error message.
        message: String,
        /// Duration of the timeout in seconds.
        duration: Option<f64>,
    },

    /// Request was aborted by the client.
    Abort {
        /// Human-readable error message.
        message: String,
    },

    /// Connection error.
    Connection {
        /// Human-readable error message.
        message: String,
        /// Underlying cause.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// Server is overloaded or unavailable.
    ServiceUnavailable {
        /// Human-readable error message.
        message: String,
        /// Time to wait before retrying, in seconds.
        retry_after: Option<u64>,
    },

    /// A credential required for the call was not configured.
    MissingCredentials {
        /// Name of the missing credential.
        credential: String,
        /// Instructions for the user.
        message: String,
    },

    /// Error during JSON or YAML serialization or deserialization.
    Serialization {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// I/O error.
    Io {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Arc<io::Error>,
    },

    /// HTTP client error.
    HttpClient {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// Error during validation of directive or request parameters.
    Validation {
        /// Human-readable error message.
        message: String,
        /// Parameter that failed validation.
        param: Option<String>,
    },

    /// A URL parsing or manipulation error.
    Url {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<url::ParseError>,
    },

    /// A streaming error occurred.
    Streaming {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// Encoding/decoding error.
    Encoding {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Creates a new API error.
    pub fn api(status_code: u16, error_type: Option<String>, message: String) -> Self {
        Error::Api {
            status_code,
            error_type,
            message,
        }
    }

    /// Creates a new authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Error::Authentication {
            message: message.into(),
        }
    }

    /// Creates a new permission error.
    pub fn permission(message: impl Into<String>) -> Self {
        Error::Permission {
            message: message.into(),
        }
    }

    /// Creates a new not found error.
    pub fn not_found(message: impl Into<String>, resource_type: Option<String>) -> Self {
        Error::NotFound {
            message: message.into(),
            resource_type,
        }
    }

    /// Creates a new rate limit error.
    pub fn rate_limit(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Error::RateLimit {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a new quota error.
    pub fn quota(message: impl Into<String>) -> Self {
        Error::Quota {
            message: message.into(),
        }
    }

    /// Creates a new safety filter error.
    pub fn safety_filter(message: impl Into<String>) -> Self {
        Error::SafetyFilter {
            message: message.into(),
        }
    }

    /// Creates a new bad request error.
    pub fn bad_request(message: impl Into<String>, param: Option<String>) -> Self {
        Error::BadRequest {
            message: message.into(),
            param,
        }
    }

    /// Creates a new timeout error.
    pub fn timeout(message: impl Into<String>, duration: Option<f64>) -> Self {
        Error::Timeout {
            message: message.into(),
            duration,
        }
    }

    /// Creates a new abort error.
    pub fn abort(message: impl Into<String>) -> Self {
        Error::Abort {
            message: message.into(),
        }
    }

    /// Creates a new connection error.
    pub fn connection(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Connection {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new service unavailable error.
    pub fn service_unavailable(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Error::ServiceUnavailable {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a new missing-credentials error.
    pub fn missing_credentials(credential: impl Into<String>, message: impl Into<String>) -> Self {
        Error::MissingCredentials {
            credential: credential.into(),
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Serialization {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new I/O error.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            message: message.into(),
            source: Arc::new(source),
        }
    }

    /// Creates a new HTTP client error.
    pub fn http_client(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::HttpClient {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>, param: Option<String>) -> Self {
        Error::Validation {
            message: message.into(),
            param,
        }
    }

    /// Creates a new URL error.
    pub fn url(message: impl Into<String>, source: Option<url::ParseError>) -> Self {
        Error::Url {
            message: message.into(),
            source,
        }
    }

    /// Creates a new streaming error.
    pub fn streaming(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Streaming {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new encoding error.
    pub fn encoding(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Encoding {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Returns true if this error is related to authentication.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::Authentication { .. })
    }

    /// Returns true if this error is related to rate limiting.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimit { .. })
    }

    /// Returns true if this error is a bad request.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Error::BadRequest { .. })
    }

    /// Returns true if this error is an abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Abort { .. })
    }

    /// Returns true if this error reports a missing credential.
    pub fn is_missing_credentials(&self) -> bool {
        matches!(self, Error::MissingCredentials { .. })
    }

    /// Returns true if this error is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Returns true if this error is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Returns the status code associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Api { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// Maps an HTTP error status and body to an error.
    ///
    /// Shared by every HTTP collaborator so that backend rejections classify
    /// the same way regardless of which service produced them.
    pub fn from_status(status_code: u16, message: String, retry_after: Option<u64>) -> Self {
        let lowered = message.to_lowercase();
        match status_code {
            400 if lowered.contains("safety") || lowered.contains("blocked") => {
                Error::safety_filter(message)
            }
            400 => Error::bad_request(message, None),
            401 => Error::authentication(message),
            403 => Error::permission(message),
            404 => Error::not_found(message, None),
            408 => Error::timeout(message, None),
            429 if lowered.contains("quota") => Error::quota(message),
            429 => Error::rate_limit(message, retry_after),
            500..=599 => Error::service_unavailable(message, retry_after),
            _ => Error::api(status_code, None, message),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Api {
                message,
                error_type,
                ..
            } => {
                if let Some(error_type) = error_type {
                    write!(f, "{error_type}: {message}")
                } else {
                    write!(f, "API error: {message}")
                }
            }
            Error::Authentication { message } => {
                write!(f, "Authentication error: {message}")
            }
            Error::Permission { message } => {
                write!(f, "Permission error: {message}")
            }
            Error::NotFound {
                message,
                resource_type,
            } => {
                if let Some(resource_type) = resource_type {
                    write!(f, "Resource not found ({resource_type}): {message}")
                } else {
                    write!(f, "Resource not found: {message}")
                }
            }
            Error::RateLimit {
                message,
                retry_after,
            } => {
                if let Some(retry_after) = retry_after {
                    write!(
                        f,
                        "Rate limit exceeded: {message} (retry after {retry_after} seconds)"
                    )
                } else {
                    write!(f, "Rate limit exceeded: {message}")
                }
            }
            Error::Quota { message } => {
                write!(f, "Quota exhausted: {message}")
            }
            Error::SafetyFilter { message } => {
                write!(f, "Blocked by safety filter: {message}")
            }
            Error::BadRequest { message, param } => {
                if let Some(param) = param {
                    write!(f, "Bad request: {message} (parameter: {param})")
                } else {
                    write!(f, "Bad request: {message}")
                }
            }
            Error::Timeout { message, duration } => {
                if let Some(duration) = duration {
                    write!(f, "Timeout error: {message} ({duration} seconds)")
                } else {
                    write!(f, "Timeout error: {message}")
                }
            }
            Error::Abort { message } => {
                write!(f, "Request aborted: {message}")
            }
            Error::Connection { message, .. } => {
                write!(f, "Connection error: {message}")
            }
            Error::ServiceUnavailable {
                message,
                retry_after,
            } => {
                if let Some(retry_after) = retry_after {
                    write!(
                        f,
                        "Service unavailable: {message} (retry after {retry_after} seconds)"
                    )
                } else {
                    write!(f, "Service unavailable: {message}")
                }
            }
            Error::MissingCredentials { message, .. } => {
                write!(f, "{message}")
            }
            Error::Serialization { message, .. } => {
                write!(f, "Serialization error: {message}")
            }
            Error::Io { message, .. } => {
                write!(f, "I/O error: {message}")
            }
            Error::HttpClient { message, .. } => {
                write!(f, "HTTP client error: {message}")
            }
            Error::Validation { message, param } => {
                if let Some(param) = param {
                    write!(f, "Validation error: {message} (parameter: {param})")
                } else {
                    write!(f, "Validation error: {message}")
                }
            }
            Error::Url { message, .. } => {
                write!(f, "URL error: {message}")
            }
            Error::Streaming { message, .. } => {
                write!(f, "Streaming error: {message}")
            }
            Error::Encoding { message, .. } => {
                write!(f, "Encoding error: {message}")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Connection { source, .. }
            | Error::Serialization { source, .. }
            | Error::HttpClient { source, .. }
            | Error::Streaming { source, .. }
            | Error::Encoding { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::Io { source, .. } => Some(source),
            Error::Url { source, .. } => {
                source.as_ref().map(|e| e as &(dyn error::Error + 'static))
            }
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err.to_string(), err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(format!("JSON error: {err}"), Some(Box::new(err)))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::serialization(format!("YAML error: {err}"), Some(Box::new(err)))
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::url(format!("URL parse error: {err}"), Some(err))
    }
}

impl From<Utf8Error> for Error {
    fn from(err: Utf8Error) -> Self {
        Error::encoding(format!("UTF-8 error: {err}"), Some(Box::new(err)))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::timeout(format!("Request timed out: {err}"), None)
        } else if err.is_connect() {
            Error::connection(format!("Connection error: {err}"), Some(Box::new(err)))
        } else {
            Error::http_client(format!("Request failed: {err}"), Some(Box::new(err)))
        }
    }
}

/// A specialized Result type for directive pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////// BackendFailure //////////////////////////////////////////

/// Classification of a failed language-model call.
///
/// Each class has exactly one user-facing string.  An aborted stream is not a
/// failure and never classifies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendFailure {
    /// Quota or rate limit exhausted.
    Quota,
    /// Missing, invalid, or unauthorized credentials.
    Auth,
    /// The backend's safety filter rejected the prompt or reply.
    Safety,
    /// The request was malformed.
    BadRequest,
    /// Anything else: transport trouble, server errors, garbled streams.
    Unavailable,
}

impl BackendFailure {
    /// Classifies an error, returning `None` for aborts.
    pub fn classify(err: &Error) -> Option<Self> {
        match err {
            Error::Abort { .. } => None,
            Error::Quota { .. } | Error::RateLimit { .. } => Some(BackendFailure::Quota),
            Error::Authentication { .. }
            | Error::Permission { .. }
            | Error::MissingCredentials { .. } => Some(BackendFailure::Auth),
            Error::SafetyFilter { .. } => Some(BackendFailure::Safety),
            Error::BadRequest { .. } | Error::Validation { .. } => {
                Some(BackendFailure::BadRequest)
            }
            _ => Some(BackendFailure::Unavailable),
        }
    }

    /// The fixed user-facing text for this failure.
    pub fn user_message(self) -> &'static str {
        match self {
            BackendFailure::Quota => {
                "The assistant has reached its usage quota. Please wait a moment and try again."
            }
            BackendFailure::Auth => {
                "The assistant could not authenticate with its backend. Check your API key."
            }
            BackendFailure::Safety => {
                "The response was blocked by the backend's safety filter. Try rephrasing your request."
            }
            BackendFailure::BadRequest => {
                "The backend rejected the request as malformed. Try starting a new conversation."
            }
            BackendFailure::Unavailable => {
                "The assistant backend is unavailable right now. Please try again later."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(Error::from_status(401, "nope".into(), None).is_authentication());
        assert!(Error::from_status(429, "slow down".into(), Some(3)).is_rate_limit());
        assert!(matches!(
            Error::from_status(429, "Quota exceeded for project".into(), None),
            Error::Quota { .. }
        ));
        assert!(matches!(
            Error::from_status(400, "prompt blocked by SAFETY".into(), None),
            Error::SafetyFilter { .. }
        ));
        assert!(Error::from_status(400, "bad field".into(), None).is_bad_request());
        assert!(matches!(
            Error::from_status(503, "busy".into(), None),
            Error::ServiceUnavailable { .. }
        ));
        assert_eq!(
            Error::from_status(418, "teapot".into(), None).status_code(),
            Some(418)
        );
    }

    #[test]
    fn abort_is_not_a_failure() {
        assert_eq!(BackendFailure::classify(&Error::abort("user")), None);
    }

    #[test]
    fn classification_covers_fixed_strings() {
        let cases = [
            (Error::quota("q"), BackendFailure::Quota),
            (Error::rate_limit("r", None), BackendFailure::Quota),
            (Error::authentication("a"), BackendFailure::Auth),
            (Error::safety_filter("s"), BackendFailure::Safety),
            (Error::bad_request("b", None), BackendFailure::BadRequest),
            (Error::streaming("x", None), BackendFailure::Unavailable),
        ];
        for (err, expected) in cases {
            let class = BackendFailure::classify(&err).expect("should classify");
            assert_eq!(class, expected, "{err}");
            assert!(!class.user_message().is_empty());
        }
    }

    #[test]
    fn missing_credentials_displays_instructions() {
        let err = Error::missing_credentials("search_key", "Set DIRECTIVE_CHAT_SEARCH_KEY.");
        assert!(err.is_missing_credentials());
        assert_eq!(err.to_string(), "Set DIRECTIVE_CHAT_SEARCH_KEY.");
    }
}
