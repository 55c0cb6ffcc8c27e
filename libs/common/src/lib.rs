//! Shared runtime plumbing for the CAN bus workspace
//!
//! Provides the pieces every binary or test harness needs before touching a bus:
//! - logging bootstrap
//! - layered configuration loading
//! - shutdown signal handling

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::{load_config, load_config_from_file};
pub use logging::{init_logging, LoggingConfig};
pub use shutdown::shutdown_token;

// Re-export common dependencies
pub use tokio;
pub use tokio_util::sync::CancellationToken;
