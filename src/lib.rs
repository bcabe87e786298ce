//! Client-side coordination of outbound work triggered from independent UI
//! components.
//!
//! The crate provides request deduplication and batching through
//! [`RequestCoordinator`], and lifecycle management of an externally loaded
//! verification widget through [`WidgetLifecycleManager`].

pub mod config;
pub mod coordinator;
pub mod core;
pub mod logging;
pub mod widget;

pub use crate::core::{CoordError, CoordResult, ScriptHost, ServiceContainer};
pub use coordinator::{CoordinatorStats, RequestCoordinator};
pub use widget::{RenderOptions, WidgetLifecycleManager};
