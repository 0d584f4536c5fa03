//! Inference session coordinator.
//!
//! Routes each inference request to a loaded model handle: resolve the
//! session's model, load it (a no-op when resident), queue behind the
//! per-model concurrency limit, and dispatch with a scoped in-flight
//! guard so the counter is released on every path. Turns within one
//! session run in submission order via per-session tickets; sessions run
//! fully in parallel with each other.

use crate::config::CoordinatorConfig;
use crate::engine::GenerationParams;
use crate::error::{CoreError, Result};
use crate::lifecycle::LifecycleManager;
use crate::session::{ConversationSession, Turn};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, oneshot};
use tracing::debug;
use uuid::Uuid;

/// A finished completion.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Completion {
    pub request_id: Uuid,
    pub model_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Caller-side handle for a submitted request.
///
/// `cancel` before dispatch aborts the request outright. After dispatch it
/// only suppresses delivery: the engine call runs to natural completion
/// and the in-flight counter is released then.
#[derive(Debug)]
pub struct CompletionHandle {
    request_id: Uuid,
    cancelled: Arc<AtomicBool>,
    rx: oneshot::Receiver<Result<Completion>>,
}

impl CompletionHandle {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Await the completion (or the error that ended the request).
    pub async fn completion(self) -> Result<Completion> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CoreError::RequestCancelled),
        }
    }
}

struct SessionSlot {
    state: Mutex<ConversationSession>,
    /// Submission-order tickets; `now_serving` advances one turn at a time.
    next_ticket: AtomicU64,
    now_serving: AtomicU64,
    turn_done: Notify,
}

impl SessionSlot {
    fn new(session_id: &str, capacity: usize) -> Self {
        Self {
            state: Mutex::new(ConversationSession::new(session_id, capacity)),
            next_ticket: AtomicU64::new(0),
            now_serving: AtomicU64::new(0),
            turn_done: Notify::new(),
        }
    }

    async fn wait_turn(&self, ticket: u64) {
        loop {
            if self.now_serving.load(Ordering::SeqCst) == ticket {
                return;
            }
            let notified = self.turn_done.notified();
            if self.now_serving.load(Ordering::SeqCst) == ticket {
                return;
            }
            notified.await;
        }
    }

    fn finish_turn(&self) {
        self.now_serving.fetch_add(1, Ordering::SeqCst);
        self.turn_done.notify_waiters();
    }
}

struct Inner {
    lifecycle: LifecycleManager,
    config: CoordinatorConfig,
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    queues: Mutex<HashMap<String, Arc<Semaphore>>>,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Coordinator for concurrent inference sessions. Cloning is cheap; all
/// clones share state.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    pub fn new(lifecycle: LifecycleManager, config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle,
                config,
                sessions: RwLock::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
            }),
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.inner.lifecycle
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().unwrap().len()
    }

    /// (completed, failed, cancelled) request counters.
    pub fn request_counters(&self) -> (u64, u64, u64) {
        (
            self.inner.completed.load(Ordering::SeqCst),
            self.inner.failed.load(Ordering::SeqCst),
            self.inner.cancelled.load(Ordering::SeqCst),
        )
    }

    pub fn bound_model(&self, session_id: &str) -> Option<String> {
        let sessions = self.inner.sessions.read().unwrap();
        let slot = sessions.get(session_id)?;
        let state = slot.state.lock().unwrap();
        state.bound_model().map(str::to_string)
    }

    /// Prompts of the retained turns for a session, oldest first.
    pub fn session_history(&self, session_id: &str) -> Vec<Turn> {
        let sessions = self.inner.sessions.read().unwrap();
        match sessions.get(session_id) {
            Some(slot) => slot.state.lock().unwrap().turns().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Drop a session's in-memory state. Called by the external
    /// idle-timeout collaborator; turns already in flight finish against
    /// their own reference to the slot.
    pub fn remove_session(&self, session_id: &str) -> bool {
        self.inner
            .sessions
            .write()
            .unwrap()
            .remove(session_id)
            .is_some()
    }

    fn session_slot(&self, session_id: &str) -> Arc<SessionSlot> {
        if let Some(slot) = self.inner.sessions.read().unwrap().get(session_id) {
            return slot.clone();
        }
        let mut sessions = self.inner.sessions.write().unwrap();
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionSlot::new(session_id, self.inner.config.history_turns))
            })
            .clone()
    }

    fn queue(&self, model_id: &str) -> Arc<Semaphore> {
        self.inner
            .queues
            .lock()
            .unwrap()
            .entry(model_id.to_string())
            .or_insert_with(|| {
                Arc::new(Semaphore::new(self.inner.config.max_concurrent_per_model.max(1)))
            })
            .clone()
    }

    /// Whether any active session is bound to this model. Loads for such
    /// models survive the critical-pressure admission bias.
    fn model_bound_to_any_session(&self, model_id: &str) -> bool {
        self.inner
            .sessions
            .read()
            .unwrap()
            .values()
            .any(|slot| slot.state.lock().unwrap().bound_model() == Some(model_id))
    }

    /// Hot-swap: load the new model and rebind the session to it. The old
    /// model is left resident and ages into normal LRU eviction, so a
    /// revert before eviction finds it still warm.
    pub async fn rebind_session(&self, session_id: &str, model_id: &str) -> Result<()> {
        let session_bound = self.model_bound_to_any_session(model_id);
        self.inner
            .lifecycle
            .request_load(model_id, session_bound)
            .await?;
        let slot = self.session_slot(session_id);
        slot.state.lock().unwrap().bind_model(model_id);
        debug!(session_id, model_id, "session rebound");
        Ok(())
    }

    /// Submit an inference request. Non-blocking: the returned handle
    /// resolves when the request completes or fails.
    pub fn submit(
        &self,
        session_id: &str,
        model_id: Option<&str>,
        prompt: String,
        params: GenerationParams,
    ) -> Result<CompletionHandle> {
        let slot = self.session_slot(session_id);
        let resolved = model_id
            .map(str::to_string)
            .or_else(|| slot.state.lock().unwrap().bound_model().map(str::to_string))
            .or_else(|| self.inner.config.default_model.clone())
            .ok_or_else(|| CoreError::UnknownModel {
                model_id: "(no model bound and no default configured)".into(),
            })?;
        if !self.inner.lifecycle.registry().contains(&resolved) {
            return Err(CoreError::UnknownModel { model_id: resolved });
        }

        let request_id = Uuid::new_v4();
        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();

        let ticket = slot.next_ticket.fetch_add(1, Ordering::SeqCst);
        let coordinator = self.clone();
        let flag = cancelled.clone();
        tokio::spawn(async move {
            slot.wait_turn(ticket).await;
            let result = coordinator
                .process(&slot, &resolved, request_id, &prompt, &params, &flag)
                .await;
            slot.finish_turn();

            match result {
                Ok(completion) => {
                    if flag.load(Ordering::SeqCst) {
                        // Cancelled after dispatch: suppress delivery only.
                        coordinator.inner.cancelled.fetch_add(1, Ordering::SeqCst);
                    } else {
                        coordinator.inner.completed.fetch_add(1, Ordering::SeqCst);
                        let _ = tx.send(Ok(completion));
                    }
                }
                Err(CoreError::RequestCancelled) => {
                    coordinator.inner.cancelled.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    coordinator.inner.failed.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(Err(e));
                }
            }
        });

        Ok(CompletionHandle {
            request_id,
            cancelled,
            rx,
        })
    }

    async fn process(
        &self,
        slot: &Arc<SessionSlot>,
        model_id: &str,
        request_id: Uuid,
        prompt: &str,
        params: &GenerationParams,
        cancelled: &AtomicBool,
    ) -> Result<Completion> {
        if cancelled.load(Ordering::SeqCst) {
            return Err(CoreError::RequestCancelled);
        }

        let session_bound = self.model_bound_to_any_session(model_id);
        let handle = self
            .inner
            .lifecycle
            .request_load(model_id, session_bound)
            .await?;

        // Per-model bounded queue with a max-wait timeout.
        let waited_ms = self.inner.config.max_queue_wait_ms;
        let permit = tokio::time::timeout(
            Duration::from_millis(waited_ms),
            self.queue(model_id).acquire_owned(),
        )
        .await
        .map_err(|_| CoreError::Overloaded {
            model_id: model_id.to_string(),
            waited_ms,
        })?
        .map_err(|_| CoreError::EngineFailure {
            message: "model worker queue closed".into(),
        })?;

        // Last cancellation point: no in-flight reference is held yet, so
        // backing out needs no handle bookkeeping.
        if cancelled.load(Ordering::SeqCst) {
            return Err(CoreError::RequestCancelled);
        }

        // Increment in-flight before dispatch; the guard's Drop releases
        // it on success, failure, and unwind alike.
        let guard = match self.inner.lifecycle.begin_request(&handle) {
            Ok(guard) => guard,
            Err(_) => {
                // Evicted between resolution and dispatch; resolve again.
                let handle = self
                    .inner
                    .lifecycle
                    .request_load(model_id, session_bound)
                    .await?;
                self.inner.lifecycle.begin_request(&handle)?
            }
        };

        let mut stream = guard.generate(prompt, params).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            text.push_str(&chunk?);
        }
        drop(guard);
        drop(permit);

        let completion = Completion {
            request_id,
            model_id: model_id.to_string(),
            text,
            created_at: Utc::now(),
        };

        let mut session = slot.state.lock().unwrap();
        session.bind_model(model_id);
        session.push_turn(Turn {
            request_id,
            model_id: model_id.to_string(),
            prompt: prompt.to_string(),
            response: completion.text.clone(),
            created_at: completion.created_at,
        });
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleConfig, MonitorConfig, ResourceBudget};
    use crate::engine::{LoadParams, MockEngine};
    use crate::monitor::ResourceMonitor;
    use crate::registry::{ModelDescriptor, ModelRegistry};

    struct Fixture {
        coordinator: SessionCoordinator,
        engine: Arc<MockEngine>,
        _dir: tempfile::TempDir,
    }

    fn fixture(budget: ResourceBudget, models: &[(&str, u64)], config: CoordinatorConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ModelRegistry::new());
        for (id, cost) in models {
            let path = dir.path().join(format!("{id}.gguf"));
            std::fs::write(&path, b"weights").unwrap();
            registry
                .register(ModelDescriptor::new(*id, path, *cost))
                .unwrap();
        }
        let monitor = ResourceMonitor::new(
            budget.clone(),
            MonitorConfig {
                staleness_timeout_secs: 3_600,
                ..MonitorConfig::default()
            },
        );
        let engine = Arc::new(MockEngine::new());
        let lifecycle = LifecycleManager::new(
            registry,
            monitor,
            engine.clone(),
            budget,
            LifecycleConfig::default(),
            LoadParams {
                context_length: 2048,
                threads: 0,
            },
        );
        Fixture {
            coordinator: SessionCoordinator::new(lifecycle, config),
            engine,
            _dir: dir,
        }
    }

    fn default_budget() -> ResourceBudget {
        ResourceBudget {
            max_concurrent_models: 2,
            max_memory_mb: 8_192,
            max_accel_memory_mb: 0,
            warning_threshold: 0.75,
            critical_threshold: 0.90,
        }
    }

    #[tokio::test]
    async fn test_submit_loads_binds_and_records_turn() {
        let f = fixture(
            default_budget(),
            &[("a", 1_000)],
            CoordinatorConfig::default(),
        );
        let handle = f
            .coordinator
            .submit("s1", Some("a"), "hello world".into(), GenerationParams::default())
            .unwrap();
        let completion = handle.completion().await.unwrap();
        assert_eq!(completion.model_id, "a");
        assert!(completion.text.contains("hello world"));

        assert_eq!(f.coordinator.bound_model("s1").as_deref(), Some("a"));
        assert_eq!(f.coordinator.session_history("s1").len(), 1);
        assert_eq!(f.coordinator.request_counters(), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_unknown_model_rejected_at_submit() {
        let f = fixture(default_budget(), &[], CoordinatorConfig::default());
        let err = f
            .coordinator
            .submit("s1", Some("ghost"), "hi".into(), GenerationParams::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownModel { .. }));

        // No explicit id, no binding, no default.
        let err = f
            .coordinator
            .submit("s1", None, "hi".into(), GenerationParams::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownModel { .. }));
    }

    #[tokio::test]
    async fn test_default_model_serves_unbound_sessions() {
        let f = fixture(
            default_budget(),
            &[("a", 1_000)],
            CoordinatorConfig {
                default_model: Some("a".into()),
                ..CoordinatorConfig::default()
            },
        );
        let handle = f
            .coordinator
            .submit("s1", None, "hi".into(), GenerationParams::default())
            .unwrap();
        let completion = handle.completion().await.unwrap();
        assert_eq!(completion.model_id, "a");
    }

    #[tokio::test]
    async fn test_session_turns_run_in_submission_order() {
        let f = fixture(
            default_budget(),
            &[("a", 1_000)],
            CoordinatorConfig::default(),
        );
        let mut handles = Vec::new();
        for i in 0..5 {
            handles.push(
                f.coordinator
                    .submit("s1", Some("a"), format!("p{i}"), GenerationParams::default())
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.completion().await.unwrap();
        }
        let prompts: Vec<_> = f
            .coordinator
            .session_history("s1")
            .iter()
            .map(|t| t.prompt.clone())
            .collect();
        assert_eq!(prompts, vec!["p0", "p1", "p2", "p3", "p4"]);
    }

    #[tokio::test]
    async fn test_queue_saturation_fails_with_overloaded() {
        let f = fixture(
            default_budget(),
            &[("a", 1_000)],
            CoordinatorConfig {
                max_concurrent_per_model: 1,
                max_queue_wait_ms: 100,
                ..CoordinatorConfig::default()
            },
        );
        let gate = f.engine.hold_generations();

        // One request per session so queueing, not session order, is
        // what serializes them.
        let first = f
            .coordinator
            .submit("s1", Some("a"), "one".into(), GenerationParams::default())
            .unwrap();
        // Give the first request time to occupy the single queue slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = f
            .coordinator
            .submit("s2", Some("a"), "two".into(), GenerationParams::default())
            .unwrap();

        let err = second.completion().await.unwrap_err();
        assert!(matches!(err, CoreError::Overloaded { .. }));

        gate.add_permits(1);
        first.completion().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch() {
        let f = fixture(
            default_budget(),
            &[("a", 1_000)],
            CoordinatorConfig::default(),
        );
        let gate = f.engine.hold_generations();

        let first = f
            .coordinator
            .submit("s1", Some("a"), "one".into(), GenerationParams::default())
            .unwrap();
        // Second turn of the same session waits for the first; cancel it
        // while it is still queued.
        let second = f
            .coordinator
            .submit("s1", Some("a"), "two".into(), GenerationParams::default())
            .unwrap();
        second.cancel();

        gate.add_permits(1);
        first.completion().await.unwrap();
        let err = second.completion().await.unwrap_err();
        assert!(matches!(err, CoreError::RequestCancelled));

        // Only the first turn was dispatched and recorded.
        assert_eq!(f.engine.generation_count(), 1);
        assert_eq!(f.coordinator.session_history("s1").len(), 1);
    }

    #[tokio::test]
    async fn test_hot_swap_rebinds_and_keeps_old_model_resident() {
        let f = fixture(
            default_budget(),
            &[("a", 1_000), ("b", 1_000)],
            CoordinatorConfig::default(),
        );
        f.coordinator
            .submit("s1", Some("a"), "hi".into(), GenerationParams::default())
            .unwrap()
            .completion()
            .await
            .unwrap();

        f.coordinator.rebind_session("s1", "b").await.unwrap();
        assert_eq!(f.coordinator.bound_model("s1").as_deref(), Some("b"));
        // Both stay loaded; the old one just becomes an eviction candidate.
        assert!(f.coordinator.lifecycle().loaded("a").is_some());
        assert!(f.coordinator.lifecycle().loaded("b").is_some());

        let completion = f
            .coordinator
            .submit("s1", None, "again".into(), GenerationParams::default())
            .unwrap()
            .completion()
            .await
            .unwrap();
        assert_eq!(completion.model_id, "b");
    }

    #[tokio::test]
    async fn test_evicted_binding_lazily_reloads() {
        // Budget of one model: using B from another session evicts A.
        let budget = ResourceBudget {
            max_concurrent_models: 1,
            max_memory_mb: 4_096,
            ..default_budget()
        };
        let f = fixture(
            budget,
            &[("a", 2_000), ("b", 2_000)],
            CoordinatorConfig::default(),
        );

        f.coordinator
            .submit("s1", Some("a"), "hi".into(), GenerationParams::default())
            .unwrap()
            .completion()
            .await
            .unwrap();
        f.coordinator
            .submit("s2", Some("b"), "hi".into(), GenerationParams::default())
            .unwrap()
            .completion()
            .await
            .unwrap();
        assert!(f.coordinator.lifecycle().loaded("a").is_none());

        // s1 still resolves to its binding; the next turn reloads A.
        let completion = f
            .coordinator
            .submit("s1", None, "back".into(), GenerationParams::default())
            .unwrap()
            .completion()
            .await
            .unwrap();
        assert_eq!(completion.model_id, "a");
        assert!(f.coordinator.lifecycle().loaded("a").is_some());
        assert_eq!(f.engine.load_count(), 3);
    }

    #[tokio::test]
    async fn test_remove_session_forgets_state() {
        let f = fixture(
            default_budget(),
            &[("a", 1_000)],
            CoordinatorConfig::default(),
        );
        f.coordinator
            .submit("s1", Some("a"), "hi".into(), GenerationParams::default())
            .unwrap()
            .completion()
            .await
            .unwrap();
        assert_eq!(f.coordinator.session_count(), 1);

        assert!(f.coordinator.remove_session("s1"));
        assert!(!f.coordinator.remove_session("s1"));
        assert_eq!(f.coordinator.session_count(), 0);
        assert!(f.coordinator.bound_model("s1").is_none());
    }

    #[tokio::test]
    async fn test_history_window_is_bounded() {
        let f = fixture(
            default_budget(),
            &[("a", 1_000)],
            CoordinatorConfig {
                history_turns: 2,
                ..CoordinatorConfig::default()
            },
        );
        for i in 0..4 {
            f.coordinator
                .submit("s1", Some("a"), format!("p{i}"), GenerationParams::default())
                .unwrap()
                .completion()
                .await
                .unwrap();
        }
        let prompts: Vec<_> = f
            .coordinator
            .session_history("s1")
            .iter()
            .map(|t| t.prompt.clone())
            .collect();
        assert_eq!(prompts, vec!["p2", "p3"]);
    }
}
