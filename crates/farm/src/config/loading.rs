use std::path::Path;
use std::time::Duration;

use crate::error::FarmError;

use super::types::{default_num_workers, BackendKind, FarmConfig, ForkOptions, Scheduling};

impl FarmConfig {
    /// Config with the given exports and defaults for everything else.
    pub fn new<I, S>(exported_methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exported_methods: exported_methods.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, FarmError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FarmError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn force_exit_timeout(&self) -> Duration {
        Duration::from_millis(self.force_exit_timeout_ms)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// - `WORKFARM_NUM_WORKERS` -> `num_workers`
    /// - `WORKFARM_MAX_RETRIES` -> `max_retries`
    /// - `WORKFARM_BACKEND` -> `backend`
    /// - `WORKFARM_SCHEDULING` -> `scheduling`
    /// - `WORKFARM_FORCE_EXIT_TIMEOUT_MS` -> `force_exit_timeout_ms`
    /// - `WORKFARM_SILENT` -> `silent`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Unparseable values are logged and ignored.
    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("WORKFARM_NUM_WORKERS") {
            match v.parse() {
                Ok(n) => self.num_workers = n,
                Err(_) => ignored("WORKFARM_NUM_WORKERS", &v),
            }
        }
        if let Some(v) = lookup("WORKFARM_MAX_RETRIES") {
            match v.parse() {
                Ok(n) => self.max_retries = n,
                Err(_) => ignored("WORKFARM_MAX_RETRIES", &v),
            }
        }
        if let Some(v) = lookup("WORKFARM_BACKEND") {
            match v.parse::<BackendKind>() {
                Ok(kind) => self.backend = kind,
                Err(_) => ignored("WORKFARM_BACKEND", &v),
            }
        }
        if let Some(v) = lookup("WORKFARM_SCHEDULING") {
            match v.parse::<Scheduling>() {
                Ok(s) => self.scheduling = s,
                Err(_) => ignored("WORKFARM_SCHEDULING", &v),
            }
        }
        if let Some(v) = lookup("WORKFARM_FORCE_EXIT_TIMEOUT_MS") {
            match v.parse() {
                Ok(ms) => self.force_exit_timeout_ms = ms,
                Err(_) => ignored("WORKFARM_FORCE_EXIT_TIMEOUT_MS", &v),
            }
        }
        if let Some(v) = lookup("WORKFARM_SILENT") {
            match v.as_str() {
                "1" | "true" => self.silent = true,
                "0" | "false" => self.silent = false,
                _ => ignored("WORKFARM_SILENT", &v),
            }
        }
    }
}

fn ignored(key: &str, value: &str) {
    tracing::warn!(key, value, "ignoring unparseable environment override");
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            exported_methods: Vec::new(),
            sequence_methods: Vec::new(),
            num_workers: default_num_workers(),
            max_retries: 3,
            backend: BackendKind::default(),
            scheduling: Scheduling::default(),
            force_exit_timeout_ms: 500,
            silent: true,
            setup_args: Vec::new(),
            fork_options: ForkOptions::default(),
        }
    }
}
