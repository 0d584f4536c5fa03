//! Deterministic in-process engine for tests and dry runs.

use super::{EngineInstance, GenerationParams, LoadParams, NativeEngine, TokenStream};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;

#[derive(Default, Debug)]
struct Counters {
    loads: AtomicU64,
    unloads: AtomicU64,
    generations: AtomicU64,
}

/// Mock engine that echoes prompts back as token chunks.
///
/// Artifacts whose file name contains `corrupt` fail to load, which is how
/// tests exercise the sticky `Failed` descriptor path. A generate gate lets
/// tests hold requests in flight while they assert on handle state.
#[derive(Debug)]
pub struct MockEngine {
    counters: Arc<Counters>,
    gate: std::sync::Mutex<Option<Arc<Semaphore>>>,
    load_delay: std::sync::Mutex<Option<std::time::Duration>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            gate: std::sync::Mutex::new(None),
            load_delay: std::sync::Mutex::new(None),
        }
    }

    /// Make every subsequent `load` sleep this long before returning.
    pub fn set_load_delay(&self, delay: std::time::Duration) {
        *self.load_delay.lock().unwrap() = Some(delay);
    }

    /// Number of successful `load` calls so far.
    pub fn load_count(&self) -> u64 {
        self.counters.loads.load(Ordering::SeqCst)
    }

    /// Number of `unload` calls so far.
    pub fn unload_count(&self) -> u64 {
        self.counters.unloads.load(Ordering::SeqCst)
    }

    /// Number of completed generations so far.
    pub fn generation_count(&self) -> u64 {
        self.counters.generations.load(Ordering::SeqCst)
    }

    /// Make every subsequent generation block until a permit is added to
    /// the returned semaphore.
    pub fn hold_generations(&self) -> Arc<Semaphore> {
        let sem = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(sem.clone());
        sem
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NativeEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn load(&self, artifact: &Path, _params: &LoadParams) -> Result<Box<dyn EngineInstance>> {
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.contains("corrupt") {
            return Err(CoreError::EngineFailure {
                message: format!("artifact '{name}' is not a valid model file"),
            });
        }
        let delay = *self.load_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        Ok(Box::new(MockInstance {
            name,
            counters: self.counters.clone(),
            gate,
        }))
    }
}

#[derive(Debug)]
struct MockInstance {
    name: String,
    counters: Arc<Counters>,
    gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl EngineInstance for MockInstance {
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<TokenStream> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| CoreError::EngineFailure {
                    message: "generate gate closed".into(),
                })?;
            // Consume the permit so each release lets exactly one
            // generation through.
            permit.forget();
        }
        self.counters.generations.fetch_add(1, Ordering::SeqCst);

        let mut tokens: Vec<String> = vec![format!("[{}] ", self.name)];
        tokens.extend(
            prompt
                .split_whitespace()
                .take(params.max_tokens)
                .map(|w| format!("{w} ")),
        );
        Ok(futures::stream::iter(tokens.into_iter().map(Ok)).boxed())
    }

    async fn unload(&self) {
        self.counters.unloads.fetch_add(1, Ordering::SeqCst);
    }
}
