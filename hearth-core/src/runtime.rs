//! The appliance runtime facade.
//!
//! `InferenceRuntime` wires the monitor, registry, lifecycle manager, and
//! coordinator together and exposes the operations the transport layer
//! calls: submit inference, register models, administrative unload, and a
//! read-only status snapshot. It owns the monitor's background task for
//! the process lifetime and stops it cleanly on shutdown.

use crate::config::{CoreConfig, ResourceBudget};
use crate::coordinator::{CompletionHandle, SessionCoordinator};
use crate::engine::{GenerationParams, LoadParams, NativeEngine, engine_from_config};
use crate::error::Result;
use crate::lifecycle::LifecycleManager;
use crate::monitor::{Pressure, ResourceMonitor, ResourceSampler, ResourceSnapshot, SystemSampler};
use crate::policy::LoadedModelStats;
use crate::registry::{ModelDescriptor, ModelRegistry};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Read-only status snapshot for monitoring and dashboards.
#[derive(Debug, Serialize)]
pub struct CoreStatus {
    pub pressure: Pressure,
    pub loaded: Vec<LoadedModelStats>,
    pub budget: ResourceBudget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<ResourceSnapshot>,
    pub sessions: usize,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_cancelled: u64,
}

/// The assembled lifecycle core.
pub struct InferenceRuntime {
    config: CoreConfig,
    registry: Arc<ModelRegistry>,
    monitor: ResourceMonitor,
    lifecycle: LifecycleManager,
    coordinator: SessionCoordinator,
    cancel: CancellationToken,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl InferenceRuntime {
    /// Build the runtime with the engine selected by configuration.
    pub fn new(config: CoreConfig) -> Result<Self> {
        let engine = engine_from_config(&config.engine)?;
        Ok(Self::with_engine(config, engine))
    }

    /// Build the runtime around a caller-provided engine.
    pub fn with_engine(config: CoreConfig, engine: Arc<dyn NativeEngine>) -> Self {
        let registry = Arc::new(ModelRegistry::new());
        let monitor = ResourceMonitor::new(config.budget.clone(), config.monitor.clone());
        let lifecycle = LifecycleManager::new(
            registry.clone(),
            monitor.clone(),
            engine,
            config.budget.clone(),
            config.lifecycle.clone(),
            LoadParams::from(&config.engine),
        );
        let coordinator = SessionCoordinator::new(lifecycle.clone(), config.coordinator.clone());
        Self {
            config,
            registry,
            monitor,
            lifecycle,
            coordinator,
            cancel: CancellationToken::new(),
            monitor_task: Mutex::new(None),
        }
    }

    /// Start the resource monitor loop with the host sampler.
    pub fn start(&self) {
        let sampler = SystemSampler::new(self.config.monitor.accel_total_mb);
        self.start_with_sampler(Box::new(sampler));
    }

    /// Start the resource monitor loop with a custom sampler.
    pub fn start_with_sampler(&self, sampler: Box<dyn ResourceSampler>) {
        let mut task = self.monitor_task.lock().unwrap();
        if task.is_some() {
            return;
        }
        *task = Some(
            self.monitor
                .spawn_sampling_task(sampler, self.cancel.clone()),
        );
        info!(
            interval_secs = self.config.monitor.sample_interval_secs,
            "resource monitor started"
        );
    }

    /// Stop the monitor loop, waiting for an in-flight sample to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.monitor_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("runtime shut down");
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    pub fn register_model(&self, descriptor: ModelDescriptor) -> Result<()> {
        self.registry.register(descriptor)
    }

    pub fn register_model_force(&self, descriptor: ModelDescriptor) -> Result<()> {
        self.registry.register_force(descriptor)
    }

    /// Register every recognizable artifact under a directory.
    pub fn scan_models(&self, dir: &Path) -> usize {
        self.registry.scan_directory(dir)
    }

    /// Submit an inference request for a session. Non-blocking; the
    /// returned handle resolves to the completion.
    pub fn submit_inference(
        &self,
        session_id: &str,
        model_id: Option<&str>,
        prompt: String,
        params: GenerationParams,
    ) -> Result<CompletionHandle> {
        self.coordinator.submit(session_id, model_id, prompt, params)
    }

    /// Hot-swap a session onto another model.
    pub async fn rebind_session(&self, session_id: &str, model_id: &str) -> Result<()> {
        self.coordinator.rebind_session(session_id, model_id).await
    }

    /// Administrative unload; defers while requests are in flight.
    pub async fn request_unload(&self, model_id: &str) -> Result<()> {
        self.lifecycle.request_unload(model_id).await
    }

    /// Snapshot of loaded models, pressure, and request counters.
    pub fn status(&self) -> CoreStatus {
        let (completed, failed, cancelled) = self.coordinator.request_counters();
        CoreStatus {
            pressure: self.monitor.current_pressure(),
            loaded: self.lifecycle.loaded_stats(),
            budget: self.config.budget.clone(),
            snapshot: self.monitor.snapshot(),
            sessions: self.coordinator.session_count(),
            requests_completed: completed,
            requests_failed: failed,
            requests_cancelled: cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use chrono::Utc;
    use std::time::Duration;

    fn runtime_with_models(models: &[(&str, u64)]) -> (InferenceRuntime, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CoreConfig::default();
        config.monitor.staleness_timeout_secs = 3_600;
        let runtime = InferenceRuntime::new(config).unwrap();
        for (id, cost) in models {
            let path = dir.path().join(format!("{id}.gguf"));
            std::fs::write(&path, b"weights").unwrap();
            runtime
                .register_model(ModelDescriptor::new(*id, path, *cost))
                .unwrap();
        }
        (runtime, dir)
    }

    #[tokio::test]
    async fn test_end_to_end_inference_and_status() {
        let (runtime, _dir) = runtime_with_models(&[("a", 1_000)]);

        let completion = runtime
            .submit_inference("s1", Some("a"), "hello".into(), GenerationParams::default())
            .unwrap()
            .completion()
            .await
            .unwrap();
        assert!(completion.text.contains("hello"));

        let status = runtime.status();
        assert_eq!(status.loaded.len(), 1);
        assert_eq!(status.loaded[0].model_id, "a");
        assert_eq!(status.loaded[0].in_flight, 0);
        assert_eq!(status.sessions, 1);
        assert_eq!(status.requests_completed, 1);

        // The snapshot serializes for dashboard consumers.
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"pressure\""));
    }

    #[tokio::test]
    async fn test_unknown_model_is_a_caller_bug() {
        let (runtime, _dir) = runtime_with_models(&[]);
        let err = runtime
            .submit_inference("s1", Some("ghost"), "hi".into(), GenerationParams::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownModel { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_monitor_task_start_and_shutdown() {
        let (runtime, _dir) = runtime_with_models(&[]);

        struct OneShot;
        impl ResourceSampler for OneShot {
            fn sample(&mut self) -> crate::error::Result<ResourceSnapshot> {
                Ok(ResourceSnapshot {
                    taken_at: Utc::now(),
                    cpu_fraction: 0.1,
                    memory_used_mb: 1_000,
                    memory_total_mb: 10_000,
                    accel_used_mb: 0,
                    accel_total_mb: 0,
                    disk_free_mb: 50_000,
                })
            }
        }

        runtime.start_with_sampler(Box::new(OneShot));
        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runtime.monitor().snapshot().is_some());

        runtime.shutdown().await;
        assert!(runtime.monitor_task.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_admin_unload_via_runtime() {
        let (runtime, _dir) = runtime_with_models(&[("a", 1_000)]);
        runtime
            .submit_inference("s1", Some("a"), "hi".into(), GenerationParams::default())
            .unwrap()
            .completion()
            .await
            .unwrap();
        assert_eq!(runtime.status().loaded.len(), 1);

        runtime.request_unload("a").await.unwrap();
        assert!(runtime.status().loaded.is_empty());

        // The binding survives; the next turn lazily reloads.
        let completion = runtime
            .submit_inference("s1", None, "again".into(), GenerationParams::default())
            .unwrap()
            .completion()
            .await
            .unwrap();
        assert_eq!(completion.model_id, "a");
    }

    #[tokio::test]
    async fn test_scan_models_registers_artifacts() {
        let (runtime, _dir) = runtime_with_models(&[]);
        let models_dir = tempfile::tempdir().unwrap();
        std::fs::write(models_dir.path().join("tiny.gguf"), vec![0u8; 1024]).unwrap();
        assert_eq!(runtime.scan_models(models_dir.path()), 1);
        assert!(runtime.registry().contains("tiny"));
    }
}
