//! Core abstractions shared by the coordinator and the widget manager
//!
//! Errors, the script host seam, process-wide metrics and the service
//! container that wires components together.

pub mod container;
pub mod error;
pub mod metrics;
pub mod traits;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use container::ServiceContainer;
pub use error::{CoordError, CoordResult, ErrorContext};
pub use metrics::encode_metrics;
pub use traits::*;
