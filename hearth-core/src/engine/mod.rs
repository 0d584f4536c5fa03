//! Native engine bindings.
//!
//! The core imposes a fixed capability contract on any engine: `load` an
//! artifact into an instance, `generate` a token stream from it, `unload`
//! it. Variants are selected at startup by configuration, not probed at
//! runtime.

pub mod llama_server;
pub mod mock;

pub use llama_server::LlamaServerEngine;
pub use mock::MockEngine;

use crate::config::EngineConfig;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Engine variants the appliance can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Deterministic in-process engine; used for tests and dry runs.
    Mock,
    /// One llama-server process per loaded model.
    LlamaServer,
}

impl Default for EngineKind {
    fn default() -> Self {
        EngineKind::Mock
    }
}

/// Parameters handed to the engine when loading an artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadParams {
    pub context_length: usize,
    /// 0 lets the engine pick.
    pub threads: usize,
}

impl From<&EngineConfig> for LoadParams {
    fn from(config: &EngineConfig) -> Self {
        Self {
            context_length: config.context_length,
            threads: config.threads,
        }
    }
}

/// Sampling parameters for a single generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.95,
            stop: Vec::new(),
        }
    }
}

/// Stream of generated token chunks.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// A native engine capable of loading model artifacts.
///
/// Load errors are reported as [`CoreError::EngineFailure`]; the lifecycle
/// manager attributes them to a model id when it marks the descriptor
/// `Failed`.
#[async_trait]
pub trait NativeEngine: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn load(&self, artifact: &Path, params: &LoadParams) -> Result<Box<dyn EngineInstance>>;
}

/// One loaded model inside an engine.
///
/// Exactly one instance exists per loaded model id; the owning
/// [`ModelHandle`](crate::lifecycle::ModelHandle) calls `unload` once no
/// request references it.
#[async_trait]
pub trait EngineInstance: Send + Sync + std::fmt::Debug {
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<TokenStream>;

    async fn unload(&self);
}

/// Build the engine selected by configuration.
pub fn engine_from_config(config: &EngineConfig) -> Result<Arc<dyn NativeEngine>> {
    match config.kind {
        EngineKind::Mock => Ok(Arc::new(MockEngine::new())),
        EngineKind::LlamaServer => {
            let bin = config
                .llama_server_bin
                .clone()
                .ok_or_else(|| CoreError::EngineFailure {
                    message: "engine.llama_server_bin is not configured".into(),
                })?;
            Ok(Arc::new(LlamaServerEngine::new(
                bin,
                config.llama_server_base_port,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_from_config_mock() {
        let engine = engine_from_config(&EngineConfig::default()).unwrap();
        assert_eq!(engine.name(), "mock");
    }

    #[test]
    fn test_engine_from_config_llama_server_requires_binary() {
        let config = EngineConfig {
            kind: EngineKind::LlamaServer,
            ..EngineConfig::default()
        };
        let err = engine_from_config(&config).unwrap_err();
        assert!(matches!(err, CoreError::EngineFailure { .. }));
    }

    #[test]
    fn test_generation_params_defaults() {
        let params = GenerationParams::default();
        assert_eq!(params.max_tokens, 512);
        assert!(params.stop.is_empty());
    }
}
