//! Tests for the core module
//!
//! Exercises the container wiring against a host that answers every call
//! synchronously, plus the error and metrics helpers.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use super::*;
use crate::{
    config::Config,
    config_error, internal_error,
    widget::{RenderOptions, RenderParams, ScriptEvents, WidgetStatus},
};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Host whose API is already on the page and whose widgets solve instantly
#[derive(Default)]
struct InstantHost {
    rendered: Mutex<u32>,
    removed: Mutex<Vec<String>>,
}

impl ScriptHost for InstantHost {
    fn api_available(&self) -> bool {
        true
    }

    fn inject_script(
        &self,
        _url: &str,
        _ready_callback: &str,
        _events: ScriptEvents,
    ) -> CoordResult<()> {
        Err(internal_error!("api already present, nothing to inject"))
    }

    fn render(&self, _target: &str, params: RenderParams) -> CoordResult<String> {
        let mut rendered = self.rendered.lock().unwrap();
        *rendered += 1;
        // Token delivered before the id is handed back
        (params.callback)("instant-token".to_string());
        Ok(format!("widget-{rendered}"))
    }

    fn reset(&self, _widget_id: Option<&str>) -> CoordResult<()> {
        Ok(())
    }

    fn remove(&self, widget_id: Option<&str>) -> CoordResult<()> {
        if let Some(id) = widget_id {
            self.removed.lock().unwrap().push(id.to_string());
        }
        Ok(())
    }

    fn get_response(&self, _widget_id: Option<&str>) -> CoordResult<Option<String>> {
        Ok(Some("instant-token".to_string()))
    }
}

#[tokio::test]
async fn test_service_container_from_config() {
    init_log();
    let config = Config::from_yaml(
        r#"
coordinator:
  batch_delay_ms: 10
widget:
  render_timeout_ms: 2500
        "#,
    )
    .unwrap();
    let container = ServiceContainer::from_config(&config, Arc::new(InstantHost::default()));

    assert_eq!(container.coordinator().batch_delay(), Duration::from_millis(10));
    assert_eq!(container.widgets().render_timeout(), Duration::from_millis(2500));
}

#[tokio::test]
async fn test_token_before_widget_id_resolves_render() {
    init_log();
    let host = Arc::new(InstantHost::default());
    let container = ServiceContainer::from_config(&Config::default(), host.clone());
    let widgets = container.widgets();

    let tokens = Arc::new(Mutex::new(Vec::new()));
    let seen = tokens.clone();
    let widget_id = widgets
        .render(
            "#login-captcha",
            RenderOptions::new("site-key", move |token| seen.lock().unwrap().push(token)),
        )
        .await
        .unwrap();

    assert_eq!(widget_id, "widget-1");
    assert_eq!(*tokens.lock().unwrap(), vec!["instant-token".to_string()]);
    let instance = widgets.registry().get(&widget_id).unwrap();
    assert_eq!(instance.status, WidgetStatus::Active);
    assert_eq!(instance.element_id, "#login-captcha");
    assert_eq!(
        widgets.get_response(Some(&widget_id)),
        Some("instant-token".to_string())
    );
}

#[tokio::test]
async fn test_teardown_clears_everything() {
    init_log();
    let host = Arc::new(InstantHost::default());
    let container = ServiceContainer::from_config(&Config::default(), host.clone());
    let widgets = container.widgets();
    for element in ["#signup", "#comment"] {
        widgets
            .render(element, RenderOptions::new("site-key", |_| {}))
            .await
            .unwrap();
    }
    let _queued = container
        .coordinator()
        .batch("lookup", 1u32, |ids: Vec<u32>| async move { Ok(ids) });

    container.teardown();

    assert!(widgets.registry().is_empty());
    let mut removed = host.removed.lock().unwrap().clone();
    removed.sort();
    assert_eq!(removed, vec!["widget-1".to_string(), "widget-2".to_string()]);
    assert_eq!(container.coordinator().get_stats().queued_batches, 0);
}

#[tokio::test]
async fn test_default_container_cannot_render() {
    init_log();
    let container = ServiceContainer::default();
    let result = container
        .widgets()
        .render("#captcha", RenderOptions::new("site-key", |_| {}))
        .await;
    assert!(matches!(result, Err(CoordError::ScriptLoad(_))));
    // Cleanup without a loaded script is a no-op
    container.teardown();
}

#[test]
fn test_error_display_and_retryable() {
    let timeout = CoordError::RenderTimeout {
        widget_id: Some("w-1".to_string()),
        timeout: Duration::from_millis(15000),
    };
    assert_eq!(
        timeout.to_string(),
        "Render timed out after 15000ms for widget w-1"
    );
    assert!(timeout.is_retryable());
    assert!(!CoordError::operation("boom").is_retryable());
    assert_eq!(
        config_error!("bad value {}", 3).to_string(),
        "Configuration error: bad value 3"
    );
}

#[test]
fn test_error_context() {
    let parsed: Result<u32, _> = "forty-two".parse::<u32>();
    match parsed.with_context("Failed to parse id") {
        Err(CoordError::Internal(msg)) => assert!(msg.starts_with("Failed to parse id: ")),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_encode_metrics_reports_dedup_counters() {
    init_log();
    let coordinator = crate::coordinator::RequestCoordinator::new();
    let first = coordinator.deduplicate("metrics", || async { Ok(1u8) });
    let second = coordinator.deduplicate("metrics", || async { Ok(2u8) });
    assert_eq!(first.await, Ok(1));
    assert_eq!(second.await, Ok(1));

    let text = encode_metrics().unwrap();
    assert!(text.contains("portalsync_dedup_invocations_total"));
    assert!(text.contains("portalsync_dedup_joins_total"));
}
