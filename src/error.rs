//! Error types for Stowage
//!
//! All modules use `StowageResult<T>` as their return type. Every variant
//! maps onto an [`ErrorKind`] so callers can decide whether a failure is
//! worth retrying on a later reconcile pass.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Stowage operations
pub type StowageResult<T> = Result<T, StowageError>;

/// Coarse classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid declaration; retrying without changing the declaration cannot help
    Configuration,
    /// Network or registry failure
    Transport,
    /// Corrupt or hostile content
    Decode,
    /// Local disk failure
    Filesystem,
    /// Caller cancelled the operation
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Transport => "transport",
            Self::Decode => "decode",
            Self::Filesystem => "filesystem",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// All errors that can occur in Stowage
#[derive(Error, Debug)]
pub enum StowageError {
    // Configuration errors
    #[error("Invalid bundle source {name}: {reason}")]
    InvalidSource { name: String, reason: String },

    #[error("Invalid bundle name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid digest {value:?}: {reason}")]
    InvalidDigest { value: String, reason: String },

    #[error("Invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    // Transport errors
    #[error("Error downloading bundle {name}: {reason}")]
    Download { name: String, reason: String },

    #[error("Error downloading bundle {name}: got status code {status}")]
    HttpStatus { name: String, status: u16 },

    #[error("Registry error for {reference}: {reason}")]
    Registry { reference: String, reason: String },

    // Decode errors
    #[error("Error unpacking bundle {name}: {reason}")]
    Decode { name: String, reason: String },

    #[error("Archive entry {entry:?} escapes the unpack directory")]
    UnsafeEntry { entry: String },

    #[error("Unsupported layer media type {media_type} in layer[{index}]")]
    UnsupportedLayer { index: usize, media_type: String },

    // Filesystem errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Invalid path: {path}: {reason}")]
    PathInvalid { path: PathBuf, reason: String },

    // Lifecycle errors
    #[error("Unpack of bundle {0} was cancelled")]
    Cancelled(String),

    #[error("{cause}{}", cleanup_suffix(.cleanup))]
    RolledBack {
        #[source]
        cause: Box<StowageError>,
        cleanup: Option<Box<StowageError>>,
    },

    #[error("Garbage collection of bundle {name} failed for {} generation(s): {}", .failures.len(), .failures.join("; "))]
    GarbageCollect { name: String, failures: Vec<String> },

    #[error("Background task failed: {0}")]
    Task(String),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("{0}")]
    User(String),
}

fn cleanup_suffix(cleanup: &Option<Box<StowageError>>) -> String {
    match cleanup {
        Some(err) => format!(" (cleanup also failed: {})", err),
        None => String::new(),
    }
}

impl StowageError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a decode error for a bundle
    pub fn decode(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Decode {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Join a failed operation with the outcome of its rollback.
    ///
    /// The returned error always carries the first cause; the cleanup
    /// failure, if any, is kept alongside it.
    pub fn rolled_back(cause: StowageError, cleanup: StowageResult<()>) -> Self {
        Self::RolledBack {
            cause: Box::new(cause),
            cleanup: cleanup.err().map(Box::new),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSource { .. }
            | Self::InvalidName { .. }
            | Self::InvalidDigest { .. }
            | Self::InvalidReference { .. }
            | Self::ConfigInvalid { .. }
            | Self::HttpClient(_)
            | Self::TomlParse(_)
            | Self::User(_) => ErrorKind::Configuration,

            Self::Download { .. } | Self::HttpStatus { .. } | Self::Registry { .. } => {
                ErrorKind::Transport
            }

            Self::Decode { .. }
            | Self::UnsafeEntry { .. }
            | Self::UnsupportedLayer { .. }
            | Self::Json(_) => ErrorKind::Decode,

            Self::Cancelled(_) => ErrorKind::Cancelled,

            Self::RolledBack { cause, .. } => cause.kind(),

            Self::ConfigDirCreate { .. }
            | Self::Io { .. }
            | Self::PathNotFound(_)
            | Self::PathInvalid { .. }
            | Self::GarbageCollect { .. }
            | Self::Task(_)
            | Self::TomlSerialize(_) => ErrorKind::Filesystem,
        }
    }

    /// Terminal errors need a change to the declared source before a retry
    /// can succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Configuration | ErrorKind::Decode)
    }

    /// Check if error is retryable on a later reconcile pass
    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::InvalidName { .. } => {
                Some("Bundle names may only contain ASCII letters, digits, '-', '_' and '.'")
            }
            Self::InvalidSource { .. } => {
                Some("Set exactly the source variant that matches the declared type")
            }
            Self::HttpStatus { .. } => Some("Check that the archive URL is reachable"),
            Self::Registry { .. } => {
                Some("Check registry credentials (STOWAGE_REGISTRY_USERNAME/PASSWORD)")
            }
            Self::RolledBack { cause, .. } => cause.hint(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StowageError::HttpStatus {
            name: "pkg-a".to_string(),
            status: 404,
        };
        assert!(err.to_string().contains("status code 404"));
    }

    #[test]
    fn error_hint() {
        let err = StowageError::InvalidName {
            name: "../x".to_string(),
            reason: "traversal".to_string(),
        };
        assert!(err.hint().is_some());
    }

    #[test]
    fn classification() {
        let decode = StowageError::decode("pkg-a", "bad gzip header");
        assert_eq!(decode.kind(), ErrorKind::Decode);
        assert!(decode.is_terminal());

        let transport = StowageError::Download {
            name: "pkg-a".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(transport.is_retryable());
        assert!(StowageError::Cancelled("pkg-a".to_string()).is_retryable());
    }

    #[test]
    fn rolled_back_keeps_cause_and_cleanup() {
        let cause = StowageError::decode("pkg-a", "truncated tar");
        let cleanup = Err(StowageError::io(
            "removing staging directory",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        ));
        let err = StowageError::rolled_back(cause, cleanup);

        let text = err.to_string();
        assert!(text.contains("truncated tar"));
        assert!(text.contains("cleanup also failed"));
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn rolled_back_without_cleanup_failure() {
        let err = StowageError::rolled_back(StowageError::Cancelled("pkg-a".into()), Ok(()));
        assert_eq!(err.to_string(), "Unpack of bundle pkg-a was cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
