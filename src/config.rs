//! Service configuration.
//!
//! All behaviour is controlled through [`ServiceConfig`], built via its
//! [`ServiceConfigBuilder`] or loaded from the environment with
//! [`ServiceConfig::from_env`]. The struct is constructed once at startup and
//! passed by reference into each component constructor; there is no global
//! configuration singleton, so every component's dependencies stay visible and
//! testable in isolation.

use crate::error::ExtractError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default Gemini model for document extraction: fast and cheap enough for
/// per-page vision calls.
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Default Gemini API endpoint prefix; the model name and `:generateContent`
/// are appended per request.
pub const DEFAULT_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Configuration for the extraction service.
///
/// # Example
/// ```rust
/// use docuvision::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .api_key("AIza...")
///     .db_path("tasks.sqlite")
///     .max_concurrent_tasks(8)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// API key for the extraction provider.
    pub api_key: String,

    /// Model identifier sent to the provider. Default: [`DEFAULT_MODEL`].
    pub model: String,

    /// Base URL of the provider API. Default: [`DEFAULT_API_BASE_URL`].
    ///
    /// Overridable so tests and proxies can point the client elsewhere.
    pub api_base_url: String,

    /// Path of the SQLite task store. Default: `tasks.sqlite`.
    pub db_path: PathBuf,

    /// Optional path of the instruction template file.
    ///
    /// When set, the file is re-read on every extraction call so the template
    /// can be edited without restarting the process. When unset, the built-in
    /// [`crate::prompts::DEFAULT_INSTRUCTION`] is used.
    pub instruction_path: Option<PathBuf>,

    /// Per-file size cap in megabytes, enforced at submission. Default: 10.
    pub max_file_size_mb: u64,

    /// Maximum number of tasks rendering/extracting at once. Default: 5.
    ///
    /// Sizes the dispatch semaphore: submission always returns immediately, but
    /// at most this many runner tasks hold a permit concurrently. Unbounded
    /// fire-and-forget dispatch under load is a real resource-exhaustion risk.
    pub max_concurrent_tasks: usize,

    /// Linear upscaling factor applied when rasterising PDF pages. Default: 2.0.
    ///
    /// Roughly 300 DPI for a typical page, which is the resolution sweet spot
    /// for vision-model recognition of small print on scanned invoices.
    pub render_scale: f32,

    /// Per-extraction-call HTTP timeout in seconds. Default: 120.
    pub request_timeout_secs: u64,

    /// Grace period for the startup recovery sweep, in seconds. Default: 3600.
    ///
    /// PROCESSING records older than this are assumed to belong to a worker
    /// that terminated abnormally and are failed by
    /// [`crate::service::ExtractionService::recover_stale`].
    pub recovery_grace_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            db_path: PathBuf::from("tasks.sqlite"),
            instruction_path: None,
            max_file_size_mb: 10,
            max_concurrent_tasks: 5,
            render_scale: 2.0,
            request_timeout_secs: 120,
            recovery_grace_secs: 3600,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("api_base_url", &self.api_base_url)
            .field("db_path", &self.db_path)
            .field("instruction_path", &self.instruction_path)
            .field("max_file_size_mb", &self.max_file_size_mb)
            .field("max_concurrent_tasks", &self.max_concurrent_tasks)
            .field("render_scale", &self.render_scale)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("recovery_grace_secs", &self.recovery_grace_secs)
            .finish()
    }
}

impl ServiceConfig {
    /// Create a new builder.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// Build a configuration from environment variables.
    ///
    /// Recognised variables: `GEMINI_API_KEY`, `GEMINI_MODEL`, `DATABASE_PATH`,
    /// `INSTRUCTION_PATH`, `MAX_FILE_SIZE_MB`, `MAX_CONCURRENT_TASKS`.
    /// Unset variables keep their defaults; `GEMINI_API_KEY` is required.
    pub fn from_env() -> Result<Self, ExtractError> {
        let mut builder = Self::builder();

        match std::env::var("GEMINI_API_KEY") {
            Ok(key) if !key.is_empty() => builder = builder.api_key(key),
            _ => {
                return Err(ExtractError::InvalidConfig(
                    "GEMINI_API_KEY is not set".into(),
                ))
            }
        }

        if let Ok(model) = std::env::var("GEMINI_MODEL") {
            if !model.is_empty() {
                builder = builder.model(model);
            }
        }
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            if !path.is_empty() {
                builder = builder.db_path(path);
            }
        }
        if let Ok(path) = std::env::var("INSTRUCTION_PATH") {
            if !path.is_empty() {
                builder = builder.instruction_path(path);
            }
        }
        if let Ok(raw) = std::env::var("MAX_FILE_SIZE_MB") {
            let mb = raw.parse().map_err(|_| {
                ExtractError::InvalidConfig(format!("MAX_FILE_SIZE_MB is not a number: '{raw}'"))
            })?;
            builder = builder.max_file_size_mb(mb);
        }
        if let Ok(raw) = std::env::var("MAX_CONCURRENT_TASKS") {
            let n = raw.parse().map_err(|_| {
                ExtractError::InvalidConfig(format!(
                    "MAX_CONCURRENT_TASKS is not a number: '{raw}'"
                ))
            })?;
            builder = builder.max_concurrent_tasks(n);
        }

        builder.build()
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = key.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = path.into();
        self
    }

    pub fn instruction_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.instruction_path = Some(path.into());
        self
    }

    pub fn max_file_size_mb(mut self, mb: u64) -> Self {
        self.config.max_file_size_mb = mb.max(1);
        self
    }

    pub fn max_concurrent_tasks(mut self, n: usize) -> Self {
        self.config.max_concurrent_tasks = n.max(1);
        self
    }

    pub fn render_scale(mut self, scale: f32) -> Self {
        self.config.render_scale = scale.clamp(1.0, 4.0);
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs.max(1);
        self
    }

    pub fn recovery_grace_secs(mut self, secs: u64) -> Self {
        self.config.recovery_grace_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, ExtractError> {
        let c = &self.config;
        if c.max_concurrent_tasks == 0 {
            return Err(ExtractError::InvalidConfig(
                "max_concurrent_tasks must be ≥ 1".into(),
            ));
        }
        if !(1.0..=4.0).contains(&c.render_scale) {
            return Err(ExtractError::InvalidConfig(format!(
                "render_scale must be 1.0–4.0, got {}",
                c.render_scale
            )));
        }
        if c.api_base_url.is_empty() {
            return Err(ExtractError::InvalidConfig("api_base_url is empty".into()));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServiceConfig::builder().build().expect("defaults build");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.max_file_size_mb, 10);
        assert_eq!(config.render_scale, 2.0);
    }

    #[test]
    fn setters_clamp() {
        let config = ServiceConfig::builder()
            .max_concurrent_tasks(0)
            .max_file_size_mb(0)
            .render_scale(99.0)
            .build()
            .expect("clamped values build");
        assert_eq!(config.max_concurrent_tasks, 1);
        assert_eq!(config.max_file_size_mb, 1);
        assert_eq!(config.render_scale, 4.0);
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = ServiceConfig::builder()
            .api_key("super-secret")
            .build()
            .expect("build");
        let dbg = format!("{config:?}");
        assert!(!dbg.contains("super-secret"));
        assert!(dbg.contains("<redacted>"));
    }
}
