use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

/// Receives the verification token once the challenge is solved
pub type TokenCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Receives the error code the widget reports
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Invoked when a previously issued token expires
pub type ExpiredCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Auto,
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Auto => "auto",
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Size {
    #[default]
    Normal,
    Compact,
    Flexible,
}

impl Size {
    pub fn as_str(&self) -> &'static str {
        match self {
            Size::Normal => "normal",
            Size::Compact => "compact",
            Size::Flexible => "flexible",
        }
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    #[default]
    Auto,
    Never,
}

impl RetryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryPolicy::Auto => "auto",
            RetryPolicy::Never => "never",
        }
    }
}

/// Caller-facing render options.
///
/// Only `sitekey` and `callback` are required. Presentation hints are passed
/// to the host untouched; `timeout` overrides the manager-wide render
/// timeout for this render only.
#[derive(Clone)]
pub struct RenderOptions {
    pub sitekey: String,
    pub callback: TokenCallback,
    pub error_callback: Option<ErrorCallback>,
    pub expired_callback: Option<ExpiredCallback>,
    pub theme: Option<Theme>,
    pub size: Option<Size>,
    pub retry: Option<RetryPolicy>,
    pub retry_interval: Option<Duration>,
    pub timeout: Option<Duration>,
}

impl RenderOptions {
    pub fn new<F>(sitekey: impl Into<String>, callback: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self {
            sitekey: sitekey.into(),
            callback: Arc::new(callback),
            error_callback: None,
            expired_callback: None,
            theme: None,
            size: None,
            retry: None,
            retry_interval: None,
            timeout: None,
        }
    }

    pub fn with_error_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.error_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_expired_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.expired_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_theme(mut self, theme: Theme) -> Self {
        self.theme = Some(theme);
        self
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy, interval: Option<Duration>) -> Self {
        self.retry = Some(retry);
        self.retry_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for RenderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderOptions")
            .field("sitekey", &self.sitekey)
            .field("error_callback", &self.error_callback.is_some())
            .field("expired_callback", &self.expired_callback.is_some())
            .field("theme", &self.theme)
            .field("size", &self.size)
            .field("retry", &self.retry)
            .field("retry_interval", &self.retry_interval)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Parameters handed to [`ScriptHost::render`](crate::core::ScriptHost::render),
/// shaped after the external contract:
/// `{sitekey, callback, error-callback?, expired-callback?, theme?, size?, retry?, retry-interval?}`.
#[derive(Clone)]
pub struct RenderParams {
    pub sitekey: String,
    pub callback: TokenCallback,
    pub error_callback: ErrorCallback,
    pub expired_callback: Option<ExpiredCallback>,
    pub theme: Option<Theme>,
    pub size: Option<Size>,
    pub retry: RetryPolicy,
    // Only meaningful with `RetryPolicy::Auto`
    pub retry_interval: Option<Duration>,
}

impl fmt::Debug for RenderParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderParams")
            .field("sitekey", &self.sitekey)
            .field("theme", &self.theme)
            .field("size", &self.size)
            .field("retry", &self.retry)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}
