use std::fs;
use std::str::FromStr;

use log::{debug, trace, LevelFilter};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::{
    config_error,
    core::CoordResult,
    widget::{DEFAULT_READY_CALLBACK, DEFAULT_SCRIPT_URL},
};

static JS_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").unwrap());

#[derive(Default, Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[validate(nested)]
    #[serde(default)]
    pub widget: WidgetConfig,

    #[validate(nested)]
    #[serde(default)]
    pub log: Log,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> CoordResult<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .map_err(|e| config_error!("Unable to read conf file from {}: {}", path, e))?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> CoordResult<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str)?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()?;

        Ok(conf)
    }

    pub fn to_yaml(&self) -> CoordResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
pub struct CoordinatorConfig {
    /// Window in which batch items coalesce
    #[validate(range(min = 1))]
    #[serde(default = "CoordinatorConfig::default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

impl CoordinatorConfig {
    fn default_batch_delay_ms() -> u64 {
        50
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_delay_ms: Self::default_batch_delay_ms(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
pub struct WidgetConfig {
    #[validate(url)]
    #[serde(default = "WidgetConfig::default_script_url")]
    pub script_url: String,
    /// Global callback the script invokes once its API is usable
    #[validate(custom(function = "WidgetConfig::validate_ready_callback"))]
    #[serde(default = "WidgetConfig::default_ready_callback")]
    pub ready_callback: String,
    #[validate(range(min = 1))]
    #[serde(default = "WidgetConfig::default_render_timeout_ms")]
    pub render_timeout_ms: u64,
    #[serde(default = "WidgetConfig::default_ready_grace_ms")]
    pub ready_grace_ms: u64,
    #[validate(range(min = 1))]
    #[serde(default = "WidgetConfig::default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl WidgetConfig {
    fn default_script_url() -> String {
        DEFAULT_SCRIPT_URL.to_string()
    }

    fn default_ready_callback() -> String {
        DEFAULT_READY_CALLBACK.to_string()
    }

    fn default_render_timeout_ms() -> u64 {
        15000
    }

    fn default_ready_grace_ms() -> u64 {
        5000
    }

    fn default_retry_interval_ms() -> u64 {
        8000
    }

    fn validate_ready_callback(name: &str) -> Result<(), ValidationError> {
        if JS_IDENTIFIER.is_match(name) {
            Ok(())
        } else {
            let mut err = ValidationError::new("invalid_ready_callback");
            err.add_param("name".into(), &name.to_string());
            Err(err)
        }
    }
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            script_url: Self::default_script_url(),
            ready_callback: Self::default_ready_callback(),
            render_timeout_ms: Self::default_render_timeout_ms(),
            ready_grace_ms: Self::default_ready_grace_ms(),
            retry_interval_ms: Self::default_retry_interval_ms(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
pub struct Log {
    #[validate(custom(function = "Log::validate_level"))]
    #[serde(default = "Log::default_level")]
    pub level: String,
    /// Append-only log file; stderr only when unset
    pub path: Option<String>,
}

impl Log {
    fn default_level() -> String {
        "info".to_string()
    }

    fn validate_level(level: &str) -> Result<(), ValidationError> {
        LevelFilter::from_str(level)
            .map(|_| ())
            .map_err(|_| ValidationError::new("invalid_log_level"))
    }

    pub fn level_filter(&self) -> LevelFilter {
        LevelFilter::from_str(&self.level).unwrap_or(LevelFilter::Info)
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::core::CoordError;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn assert_invalid(conf_str: &str) {
        match Config::from_yaml(conf_str) {
            Ok(conf) => panic!("Expected error, but got a valid config: {conf:?}"),
            Err(e) => {
                eprintln!("Error: {e}");
                assert!(matches!(e, CoordError::Configuration(_)));
            }
        }
    }

    #[test]
    fn not_a_test_i_cannot_write_yaml_by_hand() {
        init_log();
        let conf = Config::default();
        // cargo test -- --nocapture not_a_test_i_cannot_write_yaml_by_hand
        println!("{}", conf.to_yaml().unwrap());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        init_log();
        let conf = Config::from_yaml("---\n{}\n").unwrap();
        assert_eq!(50, conf.coordinator.batch_delay_ms);
        assert_eq!(DEFAULT_SCRIPT_URL, conf.widget.script_url);
        assert_eq!("onloadTurnstileCallback", conf.widget.ready_callback);
        assert_eq!(15000, conf.widget.render_timeout_ms);
        assert_eq!(5000, conf.widget.ready_grace_ms);
        assert_eq!(8000, conf.widget.retry_interval_ms);
        assert_eq!(LevelFilter::Info, conf.log.level_filter());
        assert!(conf.log.path.is_none());
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
coordinator:
  batch_delay_ms: 20

widget:
  script_url: https://widgets.example.com/verify.js?render=explicit
  ready_callback: onVerifyReady
  render_timeout_ms: 3000
  ready_grace_ms: 0

log:
  level: debug
  path: /var/log/portalsync/portalsync.log
        "#;
        let mut file = std::env::temp_dir();
        file.push(format!("portalsync-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::File::create(&file)
            .unwrap()
            .write_all(conf_str.as_bytes())
            .unwrap();

        let path = file.to_string_lossy().to_string();
        let conf = Config::load_from_yaml(path.as_str()).unwrap();
        let _ = std::fs::remove_file(&file);

        assert_eq!(20, conf.coordinator.batch_delay_ms);
        assert_eq!("onVerifyReady", conf.widget.ready_callback);
        assert_eq!(3000, conf.widget.render_timeout_ms);
        assert_eq!(0, conf.widget.ready_grace_ms);
        assert_eq!(8000, conf.widget.retry_interval_ms);
        assert_eq!(LevelFilter::Debug, conf.log.level_filter());
        assert_eq!(
            Some("/var/log/portalsync/portalsync.log"),
            conf.log.path.as_deref()
        );
        print!("{}", conf.to_yaml().unwrap());
    }

    #[test]
    fn test_missing_file() {
        init_log();
        let result = Config::load_from_yaml("/nonexistent/portalsync.yaml");
        assert!(matches!(result, Err(CoordError::Configuration(_))));
    }

    #[test]
    fn test_valid_batch_delay() {
        init_log();
        assert_invalid(
            r#"
---
coordinator:
  batch_delay_ms: 0
        "#,
        );
    }

    #[test]
    fn test_valid_script_url() {
        init_log();
        assert_invalid(
            r#"
---
widget:
  script_url: not a url
        "#,
        );
    }

    #[test]
    fn test_valid_ready_callback() {
        init_log();
        assert_invalid(
            r#"
---
widget:
  ready_callback: "window.onload()"
        "#,
        );
    }

    #[test]
    fn test_valid_render_timeout() {
        init_log();
        assert_invalid(
            r#"
---
widget:
  render_timeout_ms: 0
        "#,
        );
    }

    #[test]
    fn test_valid_log_level() {
        init_log();
        assert_invalid(
            r#"
---
log:
  level: loud
        "#,
        );
    }

    #[test]
    fn test_malformed_yaml() {
        init_log();
        assert_invalid("coordinator: [1, 2");
    }
}
