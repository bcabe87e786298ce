//! Lifecycle of the third-party verification widget
//!
//! `WidgetLifecycleManager` loads the verification script once per manager,
//! renders widgets against the host API and keeps a registry of what it
//! rendered so teardown can remove everything it created.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use arc_swap::ArcSwap;
use log::{debug, error, info, warn};
use tokio::{
    sync::oneshot,
    time::{timeout_at, Instant},
};

use crate::{
    config,
    config_error,
    core::{metrics::RENDER_TIMEOUTS, CoordError, CoordResult, ScriptHost},
};

pub mod host;
pub mod options;
pub mod registry;
pub mod script;


pub use host::HeadlessHost;
pub use options::{RenderOptions, RenderParams, RetryPolicy, Size, Theme};
pub use registry::{WidgetInstance, WidgetRegistry, WidgetStats, WidgetStatus};
pub use script::{ScriptEvents, ScriptLoadState, ScriptLoader};

pub const DEFAULT_SCRIPT_URL: &str =
    "https://challenges.cloudflare.com/turnstile/v0/api.js?render=explicit&onload=onloadTurnstileCallback";
pub const DEFAULT_READY_CALLBACK: &str = "onloadTurnstileCallback";
pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_READY_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(8000);

/// Settings for one manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetSettings {
    pub script_url: String,
    pub ready_callback: String,
    pub render_timeout: Duration,
    pub ready_grace: Duration,
    pub retry_interval: Duration,
}

impl Default for WidgetSettings {
    fn default() -> Self {
        Self {
            script_url: DEFAULT_SCRIPT_URL.to_string(),
            ready_callback: DEFAULT_READY_CALLBACK.to_string(),
            render_timeout: DEFAULT_RENDER_TIMEOUT,
            ready_grace: DEFAULT_READY_GRACE,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl From<&config::WidgetConfig> for WidgetSettings {
    fn from(value: &config::WidgetConfig) -> Self {
        Self {
            script_url: value.script_url.clone(),
            ready_callback: value.ready_callback.clone(),
            render_timeout: Duration::from_millis(value.render_timeout_ms),
            ready_grace: Duration::from_millis(value.ready_grace_ms),
            retry_interval: Duration::from_millis(value.retry_interval_ms),
        }
    }
}

/// Per-render rendezvous between the host callbacks and the awaiting caller.
///
/// The token may arrive before the host has returned the widget id, so
/// whichever of the two comes second settles the render.
struct RenderSlot {
    widget_id: Option<String>,
    token_received: bool,
    sender: Option<oneshot::Sender<String>>,
}

impl RenderSlot {
    fn lock(slot: &Mutex<RenderSlot>) -> MutexGuard<'_, RenderSlot> {
        slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_token(slot: &Mutex<RenderSlot>, registry: &WidgetRegistry) {
        let mut guard = Self::lock(slot);
        guard.token_received = true;
        if let Some(widget_id) = guard.widget_id.clone() {
            guard.settle(widget_id, registry);
        }
    }

    fn bind(slot: &Mutex<RenderSlot>, widget_id: &str, registry: &WidgetRegistry) {
        let mut guard = Self::lock(slot);
        guard.widget_id = Some(widget_id.to_string());
        if guard.token_received {
            guard.settle(widget_id.to_string(), registry);
        }
    }

    fn settle(&mut self, widget_id: String, registry: &WidgetRegistry) {
        if !registry.activate(&widget_id) {
            debug!("Token for removed widget '{widget_id}' ignored");
            return;
        }
        // The caller may have timed out already; the registry update stands
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(widget_id);
        }
    }
}

pub struct WidgetLifecycleManager {
    host: Arc<dyn ScriptHost>,
    loader: ScriptLoader,
    registry: Arc<WidgetRegistry>,
    settings: ArcSwap<WidgetSettings>,
}

impl WidgetLifecycleManager {
    pub fn new(host: Arc<dyn ScriptHost>, settings: WidgetSettings) -> Self {
        let loader = ScriptLoader::new(
            Arc::clone(&host),
            settings.script_url.clone(),
            settings.ready_callback.clone(),
            settings.ready_grace,
        );
        Self {
            host,
            loader,
            registry: Arc::new(WidgetRegistry::new()),
            settings: ArcSwap::from_pointee(settings),
        }
    }

    pub fn from_config(host: Arc<dyn ScriptHost>, config: &config::WidgetConfig) -> Self {
        Self::new(host, WidgetSettings::from(config))
    }

    pub fn registry(&self) -> &WidgetRegistry {
        &self.registry
    }

    pub fn script_state(&self) -> ScriptLoadState {
        self.loader.state()
    }

    pub fn render_timeout(&self) -> Duration {
        self.settings.load().render_timeout
    }

    /// Change the render timeout for renders issued from now on
    pub fn set_render_timeout(&self, timeout: Duration) {
        self.settings.rcu(|current| {
            let mut next = WidgetSettings::clone(current);
            next.render_timeout = timeout;
            next
        });
        info!("Render timeout set to {}ms", timeout.as_millis());
    }

    /// Load the verification script, joining a load already in progress
    pub async fn load_script(&self) -> CoordResult<()> {
        self.loader.load().await
    }

    /// Render a widget into `element_id` and resolve with its id once it
    /// produces its first token.
    ///
    /// The timeout covers the script load as well. On timeout the widget, if
    /// the host created one, stays tracked so [`remove`](Self::remove) can
    /// still clean it up.
    pub async fn render(&self, element_id: &str, options: RenderOptions) -> CoordResult<String> {
        if options.sitekey.is_empty() {
            return Err(config_error!("render into '{}' requires a site key", element_id));
        }

        let settings = self.settings.load_full();
        let timeout = options.timeout.unwrap_or(settings.render_timeout);
        let deadline = Instant::now() + timeout;

        match timeout_at(deadline, self.loader.load()).await {
            Ok(loaded) => loaded?,
            Err(_) => return Err(self.timed_out(element_id, None, timeout)),
        }

        let (sender, receiver) = oneshot::channel();
        let slot = Arc::new(Mutex::new(RenderSlot {
            widget_id: None,
            token_received: false,
            sender: Some(sender),
        }));
        let params = self.wrap_options(element_id, options, &settings, &slot);

        let widget_id = self.host.render(element_id, params).map_err(|err| {
            error!("Failed to render widget into '{element_id}': {err}");
            err
        })?;
        debug!("Host rendered widget '{widget_id}' into '{element_id}'");

        self.registry
            .track_pending(widget_id.clone(), element_id.to_string());
        RenderSlot::bind(&slot, &widget_id, &self.registry);
        // The host callbacks now hold the only references to the slot
        drop(slot);

        match timeout_at(deadline, receiver).await {
            Ok(Ok(widget_id)) => {
                info!("Widget '{widget_id}' in '{element_id}' produced a token");
                Ok(widget_id)
            }
            Ok(Err(_)) => Err(CoordError::WidgetRuntime(format!(
                "widget '{widget_id}' was discarded before producing a token"
            ))),
            Err(_) => Err(self.timed_out(element_id, Some(widget_id), timeout)),
        }
    }

    fn timed_out(
        &self,
        element_id: &str,
        widget_id: Option<String>,
        timeout: Duration,
    ) -> CoordError {
        warn!(
            "Render into '{element_id}' timed out after {}ms",
            timeout.as_millis()
        );
        RENDER_TIMEOUTS.inc();
        CoordError::RenderTimeout { widget_id, timeout }
    }

    fn wrap_options(
        &self,
        element_id: &str,
        options: RenderOptions,
        settings: &WidgetSettings,
        slot: &Arc<Mutex<RenderSlot>>,
    ) -> RenderParams {
        let user_callback = options.callback;
        let registry = Arc::clone(&self.registry);
        let token_slot = Arc::clone(slot);
        let callback = Arc::new(move |token: String| {
            user_callback(token);
            RenderSlot::on_token(&token_slot, &registry);
        });

        // Widget errors are forwarded, never fatal to the render
        let user_error_callback = options.error_callback;
        let element = element_id.to_string();
        let error_callback = Arc::new(move |code: String| {
            warn!("Widget in '{element}' reported an error: {code}");
            if let Some(forward) = &user_error_callback {
                forward(code);
            }
        });

        let retry = options.retry.unwrap_or_default();
        let retry_interval = match retry {
            RetryPolicy::Auto => Some(options.retry_interval.unwrap_or(settings.retry_interval)),
            RetryPolicy::Never => None,
        };
        debug!(
            "Rendering into '{element_id}' (theme {}, size {}, retry {})",
            options.theme.unwrap_or_default().as_str(),
            options.size.unwrap_or_default().as_str(),
            retry.as_str()
        );

        RenderParams {
            sitekey: options.sitekey,
            callback,
            error_callback,
            expired_callback: options.expired_callback,
            theme: options.theme,
            size: options.size,
            retry,
            retry_interval,
        }
    }

    /// Best-effort reset; failures are logged, never returned
    pub fn reset(&self, widget_id: Option<&str>) {
        if !self.guard("reset", widget_id) {
            return;
        }
        if let Err(err) = self.host.reset(widget_id) {
            warn!(
                "Failed to reset widget {}: {err}",
                widget_id.unwrap_or("<latest>")
            );
        }
    }

    /// Best-effort remove; the registry entry is dropped even if the host fails
    pub fn remove(&self, widget_id: Option<&str>) {
        if self.guard("remove", widget_id) {
            if let Err(err) = self.host.remove(widget_id) {
                warn!(
                    "Failed to remove widget {}: {err}",
                    widget_id.unwrap_or("<latest>")
                );
            }
        }
        if let Some(id) = widget_id {
            self.registry.remove(id);
        }
    }

    /// Remove every widget this manager rendered
    pub fn remove_all(&self) {
        let widget_ids = self.registry.snapshot_ids();
        info!("Removing {} widgets", widget_ids.len());
        for widget_id in &widget_ids {
            self.remove(Some(widget_id));
        }
    }

    /// Current token of a widget, `None` when unavailable for any reason
    pub fn get_response(&self, widget_id: Option<&str>) -> Option<String> {
        if !self.guard("get_response", widget_id) {
            return None;
        }
        match self.host.get_response(widget_id) {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    "Failed to read response of widget {}: {err}",
                    widget_id.unwrap_or("<latest>")
                );
                None
            }
        }
    }

    fn guard(&self, action: &str, widget_id: Option<&str>) -> bool {
        if !self.loader.is_loaded() {
            debug!("Skipping {action}, verification script not loaded");
            return false;
        }
        match widget_id {
            Some(id) if !self.registry.contains(id) => {
                debug!("Skipping {action} of unknown widget '{id}'");
                false
            }
            _ => true,
        }
    }
}
