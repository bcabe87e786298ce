//! Core traits for portalsync components
//!
//! The verification widget lives in an environment this crate does not own
//! (a browser page, an embedded webview, a test double). `ScriptHost` is the
//! capability interface over that environment.

use crate::widget::{options::RenderParams, script::ScriptEvents};

use super::error::CoordResult;

/// Environment able to load the verification script and drive its API.
///
/// Implementations mirror the externally fixed widget contract:
/// `render(target, params) -> id`, `reset(id?)`, `remove(id?)`,
/// `getResponse(id?)`. Calls are synchronous; asynchronous progress of the
/// script load is reported back through [`ScriptEvents`].
pub trait ScriptHost: Send + Sync {
    /// Whether the widget API is already present without an injection
    fn api_available(&self) -> bool;

    /// Inject the script resource.
    ///
    /// `ready_callback` is the reserved global name the script invokes once
    /// initialised; the host must route that invocation to
    /// [`ScriptEvents::ready`], the resource's native load event to
    /// [`ScriptEvents::loaded`] and a network/script error to
    /// [`ScriptEvents::failed`].
    fn inject_script(&self, url: &str, ready_callback: &str, events: ScriptEvents)
        -> CoordResult<()>;

    /// Render a widget into the element identified by `target`
    fn render(&self, target: &str, params: RenderParams) -> CoordResult<String>;

    /// Reset a widget, or the most recent one when `widget_id` is `None`
    fn reset(&self, widget_id: Option<&str>) -> CoordResult<()>;

    /// Remove a widget, or the most recent one when `widget_id` is `None`
    fn remove(&self, widget_id: Option<&str>) -> CoordResult<()>;

    /// Current response token of a widget, if it has one
    fn get_response(&self, widget_id: Option<&str>) -> CoordResult<Option<String>>;
}
