use log::debug;

use crate::core::{CoordError, CoordResult, ScriptHost};

use super::{options::RenderParams, script::ScriptEvents};

const UNSUPPORTED: &str = "verification widgets require a browser environment";

/// Host for processes without a scripting environment.
///
/// Every load attempt fails with a recoverable `ScriptLoad` error, so
/// renders reject cleanly and cleanup calls become no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessHost;

impl ScriptHost for HeadlessHost {
    fn api_available(&self) -> bool {
        false
    }

    fn inject_script(
        &self,
        url: &str,
        _ready_callback: &str,
        _events: ScriptEvents,
    ) -> CoordResult<()> {
        debug!("Refusing to inject {url} in a headless process");
        Err(CoordError::ScriptLoad(UNSUPPORTED.to_string()))
    }

    fn render(&self, _target: &str, _params: RenderParams) -> CoordResult<String> {
        Err(CoordError::ScriptLoad(UNSUPPORTED.to_string()))
    }

    fn reset(&self, _widget_id: Option<&str>) -> CoordResult<()> {
        Err(CoordError::ScriptLoad(UNSUPPORTED.to_string()))
    }

    fn remove(&self, _widget_id: Option<&str>) -> CoordResult<()> {
        Err(CoordError::ScriptLoad(UNSUPPORTED.to_string()))
    }

    fn get_response(&self, _widget_id: Option<&str>) -> CoordResult<Option<String>> {
        Ok(None)
    }
}
