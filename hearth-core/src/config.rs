//! Configuration system for the Hearth core.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment.
//! Configuration is loaded from `~/.config/hearth/config.toml` and/or `.hearth/config.toml`
//! in the appliance data directory, with `HEARTH_` environment overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::engine::EngineKind;

/// Top-level configuration for the Hearth core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    pub budget: ResourceBudget,
    pub monitor: MonitorConfig,
    pub lifecycle: LifecycleConfig,
    pub coordinator: CoordinatorConfig,
    pub engine: EngineConfig,
}

/// Static resource budget shared across every loaded model.
///
/// The lifecycle manager never lets aggregate reservations exceed these
/// limits, no matter how many load requests race.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceBudget {
    /// Maximum number of concurrently loaded models.
    pub max_concurrent_models: usize,
    /// Maximum aggregate reserved resident memory, in MB.
    pub max_memory_mb: u64,
    /// Maximum aggregate reserved accelerator memory, in MB (0 = no accelerator).
    pub max_accel_memory_mb: u64,
    /// Fraction of total usage at which pressure becomes `Warning`.
    pub warning_threshold: f64,
    /// Fraction of total usage at which pressure becomes `Critical`.
    pub critical_threshold: f64,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            max_concurrent_models: 2,
            max_memory_mb: 16_384,
            max_accel_memory_mb: 0,
            warning_threshold: 0.75,
            critical_threshold: 0.90,
        }
    }
}

/// Configuration for the resource monitor loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between resource samples.
    pub sample_interval_secs: u64,
    /// Number of recent snapshots retained for trend smoothing.
    pub window: usize,
    /// Seconds after which the last snapshot is considered stale and
    /// pressure is forced to `Critical`.
    pub staleness_timeout_secs: u64,
    /// Total accelerator memory in MB reported by snapshots when no
    /// accelerator probe is wired in.
    pub accel_total_mb: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5,
            window: 5,
            staleness_timeout_secs: 30,
            accel_total_mb: 0,
        }
    }
}

/// Configuration for lifecycle transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Upper bound on a single engine load call, in seconds.
    pub load_timeout_secs: u64,
    /// Upper bound on waiting for an eviction victim's in-flight
    /// requests to drain, in seconds.
    pub eviction_drain_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            load_timeout_secs: 120,
            eviction_drain_timeout_secs: 30,
        }
    }
}

/// Configuration for the inference session coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Concurrent requests dispatched per model.
    pub max_concurrent_per_model: usize,
    /// Milliseconds a request may wait in a model's queue before
    /// failing with `Overloaded`.
    pub max_queue_wait_ms: u64,
    /// Turns retained per session; older turns are evicted.
    pub history_turns: usize,
    /// Model used for sessions with no binding and no explicit id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_model: 4,
            max_queue_wait_ms: 5_000,
            history_turns: 32,
            default_model: None,
        }
    }
}

/// Configuration for the native engine binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Which engine variant to use.
    pub kind: EngineKind,
    /// Context window passed to the engine on load.
    pub context_length: usize,
    /// Worker threads passed to the engine on load (0 = engine default).
    pub threads: usize,
    /// Path to the llama-server binary (LlamaServer engine only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llama_server_bin: Option<PathBuf>,
    /// First port used for llama-server instances; each loaded model
    /// takes the next free port above it.
    pub llama_server_base_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Mock,
            context_length: 4096,
            threads: 0,
            llama_server_bin: None,
            llama_server_base_port: 8200,
        }
    }
}

/// Load configuration with the standard layering:
/// defaults -> user config file -> appliance config file -> `HEARTH_` env vars.
pub fn load_config(data_dir: Option<&Path>) -> Result<CoreConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(CoreConfig::default()));

    if let Some(base) = directories::BaseDirs::new() {
        let user_config = base.home_dir().join(".config/hearth/config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(dir) = data_dir {
        let local_config = dir.join(".hearth/config.toml");
        if local_config.exists() {
            figment = figment.merge(Toml::file(&local_config));
        }
    }

    figment = figment.merge(Env::prefixed("HEARTH_").split("__"));

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_budget() {
        let budget = ResourceBudget::default();
        assert_eq!(budget.max_concurrent_models, 2);
        assert_eq!(budget.max_memory_mb, 16_384);
        assert!(budget.warning_threshold < budget.critical_threshold);
    }

    #[test]
    fn test_default_config_is_mock_engine() {
        let config = CoreConfig::default();
        assert_eq!(config.engine.kind, EngineKind::Mock);
        assert_eq!(config.monitor.sample_interval_secs, 5);
        assert_eq!(config.monitor.window, 5);
    }

    #[test]
    fn test_load_config_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(".hearth");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            r#"
[budget]
max_concurrent_models = 4
max_memory_mb = 32768

[coordinator]
default_model = "phi-3-mini"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert_eq!(config.budget.max_concurrent_models, 4);
        assert_eq!(config.budget.max_memory_mb, 32_768);
        assert_eq!(
            config.coordinator.default_model.as_deref(),
            Some("phi-3-mini")
        );
        // Unspecified sections keep defaults.
        assert_eq!(config.lifecycle.load_timeout_secs, 120);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = CoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.budget.max_memory_mb, config.budget.max_memory_mb);
    }
}
