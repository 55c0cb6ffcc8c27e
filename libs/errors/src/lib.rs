//! Unified error handling for the CAN bus runtime
//!
//! Every crate in the workspace reports failures through [`CanError`], so a
//! receive loop, a cyclic task and a caller all speak the same taxonomy.

use thiserror::Error;

// ============================================================================
// CanError - Main error type
// ============================================================================

/// Main error type for bus drivers, cyclic tasks and notifiers
///
/// The type is `Clone` because a receive-loop failure is both recorded against
/// its bus and handed back to whoever stops the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanError {
    // ======================================
    // Construction Errors
    // ======================================
    /// Fatal error raised while opening or configuring a bus. Retrying the
    /// same configuration will fail again.
    #[error("CAN initialization error: {0}")]
    Initialization(String),

    /// Malformed input such as an empty frame sequence or an out-of-range DLC
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The driver does not support the requested capability
    #[error("Interface not implemented: {0}")]
    InterfaceNotImplemented(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // ======================================
    // Per-call Errors
    // ======================================
    /// Transient failure of a single send or receive call
    #[error("CAN operation error: {message}")]
    Operation {
        message: String,
        /// Driver specific error code, if the backend reports one
        code: Option<i32>,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Bus already shut down: {0}")]
    Shutdown(String),
}

/// Result type alias using CanError
pub type CanResult<T> = Result<T, CanError>;

impl CanError {
    /// Build an operation error without a driver code
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
            code: None,
        }
    }

    /// Build an operation error carrying the backend's error code
    pub fn operation_with_code(message: impl Into<String>, code: i32) -> Self {
        Self::Operation {
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn not_implemented(capability: impl Into<String>) -> Self {
        Self::InterfaceNotImplemented(capability.into())
    }

    /// Stable error code for logs and monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Initialization(_) => "INITIALIZATION_ERROR",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::InterfaceNotImplemented(_) => "INTERFACE_NOT_IMPLEMENTED",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Operation { .. } => "OPERATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Shutdown(_) => "BUS_SHUTDOWN",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Initialization(_) => ErrorCategory::Initialization,
            Self::InvalidArgument(_) => ErrorCategory::Validation,
            Self::InterfaceNotImplemented(_) => ErrorCategory::Unsupported,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Operation { .. } | Self::Shutdown(_) => ErrorCategory::Transport,
            Self::Timeout(_) => ErrorCategory::Timeout,
        }
    }

    /// Whether the same call may succeed if issued again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Operation { .. } | Self::Timeout(_))
    }

    /// True for the "capability missing" answer a listener gives when it does
    /// not handle errors
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::InterfaceNotImplemented(_))
    }

    /// Get log level
    pub fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Initialization | ErrorCategory::Configuration => Level::ERROR,
            ErrorCategory::Transport | ErrorCategory::Timeout => Level::WARN,
            ErrorCategory::Validation | ErrorCategory::Unsupported => Level::INFO,
        }
    }
}

/// Error category enum - used for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Initialization,
    Configuration,
    Validation,
    Unsupported,
    Transport,
    Timeout,
}

// Conversion traits for common error types
impl From<std::io::Error> for CanError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::Timeout(err.to_string())
            },
            _ => Self::Operation {
                message: err.to_string(),
                code: err.raw_os_error(),
            },
        }
    }
}

impl From<figment::Error> for CanError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! invalid_argument {
    ($msg:expr) => {
        $crate::CanError::InvalidArgument($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::CanError::InvalidArgument(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! operation_error {
    ($msg:expr) => {
        $crate::CanError::operation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::CanError::operation(format!($fmt, $($arg)*))
    };
}
