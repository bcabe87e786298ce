//! Unified error handling for portalsync
//!
//! Every failure a caller can observe is a `CoordError`. Errors are `Clone`
//! because a single outcome (a deduplicated operation, a batch flush, a
//! script load) is fanned out to every caller that joined it.

use std::{fmt, time::Duration};

/// Unified error types for the coordination layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordError {
    /// The verification script failed to load, or the host cannot load scripts
    ScriptLoad(String),

    /// A render did not produce a token within its timeout
    RenderTimeout {
        widget_id: Option<String>,
        timeout: Duration,
    },

    /// The external widget reported an error after rendering
    WidgetRuntime(String),

    /// The batch function failed or returned a malformed result list
    Batch(String),

    /// A caller-supplied operation failed
    Operation(String),

    /// The pending entry this caller was waiting on was dropped by teardown
    Abandoned(String),

    /// Configuration-related errors
    Configuration(String),

    /// Internal system errors
    Internal(String),
}

impl CoordError {
    /// Shorthand for wrapping a caller-side failure
    pub fn operation(msg: impl fmt::Display) -> Self {
        CoordError::Operation(msg.to_string())
    }

    /// Whether the failure left shared state in a retryable condition
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordError::ScriptLoad(_) | CoordError::RenderTimeout { .. } | CoordError::Abandoned(_)
        )
    }
}

impl fmt::Display for CoordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordError::ScriptLoad(msg) => write!(f, "Script load failed: {msg}"),
            CoordError::RenderTimeout { widget_id, timeout } => match widget_id {
                Some(id) => write!(
                    f,
                    "Render timed out after {}ms for widget {id}",
                    timeout.as_millis()
                ),
                None => write!(f, "Render timed out after {}ms", timeout.as_millis()),
            },
            CoordError::WidgetRuntime(msg) => write!(f, "Widget error: {msg}"),
            CoordError::Batch(msg) => write!(f, "Batch failed: {msg}"),
            CoordError::Operation(msg) => write!(f, "Operation failed: {msg}"),
            CoordError::Abandoned(msg) => write!(f, "Abandoned: {msg}"),
            CoordError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            CoordError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for CoordError {}

impl From<serde_yaml::Error> for CoordError {
    fn from(err: serde_yaml::Error) -> Self {
        CoordError::Configuration(err.to_string())
    }
}

impl From<validator::ValidationErrors> for CoordError {
    fn from(err: validator::ValidationErrors) -> Self {
        CoordError::Configuration(err.to_string())
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Result type alias for coordination operations
pub type CoordResult<T> = std::result::Result<T, CoordError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> CoordResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> CoordResult<T> {
        self.map_err(|e| CoordError::Internal(format!("{context}: {e}")))
    }
}

/// Convenience macros for error creation
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::core::CoordError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::CoordError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::core::CoordError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::CoordError::Internal(format!($fmt, $($arg)*))
    };
}
