//! llama-server engine binding.
//!
//! Spawns one `llama-server` process per loaded model and talks to its
//! HTTP completion endpoint. The process is killed on unload (and on drop,
//! as a backstop, via `kill_on_drop`).

use super::{EngineInstance, GenerationParams, LoadParams, NativeEngine, TokenStream};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const HEALTH_POLL_ATTEMPTS: u32 = 120;

#[derive(Debug)]
pub struct LlamaServerEngine {
    server_bin: PathBuf,
    next_port: AtomicU16,
    client: reqwest::Client,
}

impl LlamaServerEngine {
    pub fn new(server_bin: PathBuf, base_port: u16) -> Self {
        Self {
            server_bin,
            next_port: AtomicU16::new(base_port),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NativeEngine for LlamaServerEngine {
    fn name(&self) -> &str {
        "llama-server"
    }

    async fn load(&self, artifact: &Path, params: &LoadParams) -> Result<Box<dyn EngineInstance>> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let mut cmd = tokio::process::Command::new(&self.server_bin);
        cmd.arg("-m")
            .arg(artifact)
            .arg("--port")
            .arg(port.to_string())
            .arg("--ctx-size")
            .arg(params.context_length.to_string());
        if params.threads > 0 {
            cmd.arg("--threads").arg(params.threads.to_string());
        }
        cmd.stdout(Stdio::null()).stderr(Stdio::null()).kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| CoreError::EngineFailure {
            message: format!("failed to spawn llama-server: {e}"),
        })?;

        let endpoint = format!("http://127.0.0.1:{port}");
        let health_url = format!("{endpoint}/health");
        let mut healthy = false;
        for _ in 0..HEALTH_POLL_ATTEMPTS {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(CoreError::EngineFailure {
                    message: format!("llama-server exited during startup: {status}"),
                });
            }
            if let Ok(resp) = self.client.get(&health_url).send().await {
                if resp.status().is_success() {
                    healthy = true;
                    break;
                }
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
        if !healthy {
            let _ = child.start_kill();
            return Err(CoreError::EngineFailure {
                message: format!("llama-server on port {port} never became healthy"),
            });
        }

        debug!(artifact = %artifact.display(), port, "llama-server instance ready");
        Ok(Box::new(LlamaServerInstance {
            endpoint,
            client: self.client.clone(),
            child: tokio::sync::Mutex::new(Some(child)),
        }))
    }
}

#[derive(Debug)]
struct LlamaServerInstance {
    endpoint: String,
    client: reqwest::Client,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
}

#[async_trait]
impl EngineInstance for LlamaServerInstance {
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<TokenStream> {
        let body = serde_json::json!({
            "prompt": prompt,
            "n_predict": params.max_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "stop": params.stop,
        });
        let resp = self
            .client
            .post(format!("{}/completion", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::EngineFailure {
                message: format!("completion request failed: {e}"),
            })?;
        let value: serde_json::Value =
            resp.json().await.map_err(|e| CoreError::EngineFailure {
                message: format!("completion response parse failed: {e}"),
            })?;
        let content = value
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(futures::stream::once(async move { Ok(content) }).boxed())
    }

    async fn unload(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("failed to kill llama-server process: {e}");
            }
        }
    }
}
