//! Model lifecycle manager.
//!
//! Owns every loaded model handle and performs all load, unload, and
//! eviction transitions. Per-model-id async locks serialize transitions
//! (at most one in flight per id), a tiny global accounting lock keeps the
//! aggregate reservations within budget no matter how many loads race,
//! and atomic in-flight counters protect busy handles from being torn
//! down under an active request.
//!
//! State machine per model id:
//! `Registered -> Loading -> Loaded -> Unloading -> Registered`, with
//! `Loading -> Failed -> Registered` on engine failure (sticky until the
//! model is re-registered). Unloading cannot fail: it only proceeds once
//! the in-flight count is zero.

use crate::config::{LifecycleConfig, ResourceBudget};
use crate::engine::{GenerationParams, LoadParams, NativeEngine, TokenStream};
use crate::error::{CoreError, Result};
use crate::monitor::ResourceMonitor;
use crate::policy::{self, AdmissionDecision, LoadRequest, LoadedModelStats};
use crate::registry::{ModelRegistry, ModelStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// One loaded model: the engine instance plus its bookkeeping.
///
/// Exactly one handle exists per loaded model id. A handle with a nonzero
/// in-flight counter is never destroyed.
pub struct ModelHandle {
    model_id: String,
    instance: Box<dyn crate::engine::EngineInstance>,
    memory_reserved_mb: u64,
    accel_reserved_mb: u64,
    in_flight: AtomicU64,
    last_active_ms: AtomicI64,
    created_at: DateTime<Utc>,
    evict_requested: AtomicBool,
    drained: Notify,
}

impl ModelHandle {
    fn new(
        model_id: String,
        instance: Box<dyn crate::engine::EngineInstance>,
        memory_reserved_mb: u64,
        accel_reserved_mb: u64,
    ) -> Self {
        Self {
            model_id,
            instance,
            memory_reserved_mb,
            accel_reserved_mb,
            in_flight: AtomicU64::new(0),
            last_active_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            created_at: Utc::now(),
            evict_requested: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn memory_reserved_mb(&self) -> u64 {
        self.memory_reserved_mb
    }

    pub fn accel_reserved_mb(&self) -> u64 {
        self.accel_reserved_mb
    }

    pub fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::SeqCst)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn evict_requested(&self) -> bool {
        self.evict_requested.load(Ordering::SeqCst)
    }

    /// Refresh the last-activity timestamp.
    pub fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn stats(&self) -> LoadedModelStats {
        LoadedModelStats {
            model_id: self.model_id.clone(),
            memory_reserved_mb: self.memory_reserved_mb,
            accel_reserved_mb: self.accel_reserved_mb,
            in_flight: self.in_flight(),
            last_active_ms: self.last_active_ms(),
        }
    }

    fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    /// Decrement the in-flight counter, waking drain waiters at zero.
    /// Returns the remaining count.
    fn finish(&self) -> u64 {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            // Underflow means a release without a matching begin. Undo and
            // abort this operation; other models are unaffected.
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            error!(model_id = %self.model_id, "in-flight counter underflow");
            return 0;
        }
        self.touch();
        let remaining = prev - 1;
        if remaining == 0 {
            self.drained.notify_waiters();
        }
        remaining
    }

    fn mark_evict_requested(&self) {
        self.evict_requested.store(true, Ordering::SeqCst);
    }

    fn clear_evict_requested(&self) {
        self.evict_requested.store(false, Ordering::SeqCst);
    }

    fn drain_signal(&self) -> tokio::sync::futures::Notified<'_> {
        self.drained.notified()
    }

    pub(crate) async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream> {
        self.instance.generate(prompt, params).await
    }

    async fn unload_instance(&self) {
        self.instance.unload().await;
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_id", &self.model_id)
            .field("memory_reserved_mb", &self.memory_reserved_mb)
            .field("in_flight", &self.in_flight())
            .field("evict_requested", &self.evict_requested())
            .finish()
    }
}

/// Scoped in-flight reference to a loaded model.
///
/// Dropping the guard always releases the counter, so no code path (not
/// even a panic unwind in the dispatch path) can leak a reference and
/// pin a handle forever.
pub struct InFlightGuard {
    manager: LifecycleManager,
    handle: Arc<ModelHandle>,
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightGuard")
            .field("model_id", &self.handle.model_id())
            .finish_non_exhaustive()
    }
}

impl InFlightGuard {
    pub fn model_id(&self) -> &str {
        self.handle.model_id()
    }

    pub async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<TokenStream> {
        self.handle.touch();
        self.handle.generate(prompt, params).await
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.manager.release(&self.handle);
    }
}

#[derive(Default)]
struct Accounting {
    memory_mb: u64,
    accel_mb: u64,
    models: usize,
}

struct Inner {
    registry: Arc<ModelRegistry>,
    monitor: ResourceMonitor,
    engine: Arc<dyn NativeEngine>,
    budget: ResourceBudget,
    config: LifecycleConfig,
    load_params: LoadParams,
    handles: RwLock<HashMap<String, Arc<ModelHandle>>>,
    transition_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    accounting: Mutex<Accounting>,
}

/// Owner of the loaded-model set. Cloning is cheap; all clones share state.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<ModelRegistry>,
        monitor: ResourceMonitor,
        engine: Arc<dyn NativeEngine>,
        budget: ResourceBudget,
        config: LifecycleConfig,
        load_params: LoadParams,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                monitor,
                engine,
                budget,
                config,
                load_params,
                handles: RwLock::new(HashMap::new()),
                transition_locks: Mutex::new(HashMap::new()),
                accounting: Mutex::new(Accounting::default()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.registry
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.inner.monitor
    }

    pub fn budget(&self) -> &ResourceBudget {
        &self.inner.budget
    }

    /// The handle for a loaded model, if any.
    pub fn loaded(&self, model_id: &str) -> Option<Arc<ModelHandle>> {
        self.inner.handles.read().unwrap().get(model_id).cloned()
    }

    /// Stats for every loaded handle.
    pub fn loaded_stats(&self) -> Vec<LoadedModelStats> {
        let mut stats: Vec<_> = self
            .inner
            .handles
            .read()
            .unwrap()
            .values()
            .map(|h| h.stats())
            .collect();
        stats.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        stats
    }

    /// Aggregate reservations: (memory MB, accelerator MB, model count).
    pub fn reserved(&self) -> (u64, u64, usize) {
        let acc = self.inner.accounting.lock().unwrap();
        (acc.memory_mb, acc.accel_mb, acc.models)
    }

    fn transition_lock(&self, model_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .transition_locks
            .lock()
            .unwrap()
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Atomically reserve budget for a load, rejecting any reservation
    /// that would overshoot. Loads of different models race past the
    /// per-id locks, so this is the final budget gate.
    fn try_reserve(&self, model_id: &str, memory_mb: u64, accel_mb: u64) -> Result<()> {
        let mut acc = self.inner.accounting.lock().unwrap();
        let over_memory = acc.memory_mb + memory_mb > self.inner.budget.max_memory_mb;
        let over_accel = acc.accel_mb + accel_mb > self.inner.budget.max_accel_memory_mb;
        let over_count = acc.models + 1 > self.inner.budget.max_concurrent_models;
        if over_memory || over_accel || over_count {
            return Err(CoreError::InsufficientResources {
                model_id: model_id.to_string(),
                needed_mb: memory_mb,
                reclaimable_mb: self.inner.budget.max_memory_mb.saturating_sub(acc.memory_mb),
            });
        }
        acc.memory_mb += memory_mb;
        acc.accel_mb += accel_mb;
        acc.models += 1;
        Ok(())
    }

    fn release_reservation(&self, memory_mb: u64, accel_mb: u64) {
        let mut acc = self.inner.accounting.lock().unwrap();
        if acc.memory_mb < memory_mb || acc.models == 0 {
            error!("reservation accounting underflow");
        }
        acc.memory_mb = acc.memory_mb.saturating_sub(memory_mb);
        acc.accel_mb = acc.accel_mb.saturating_sub(accel_mb);
        acc.models = acc.models.saturating_sub(1);
    }

    /// Load a model, evicting idle victims if the policy calls for it.
    ///
    /// Returns the existing handle when the model is already loaded, and
    /// joins an in-flight load by the per-id lock rather than loading
    /// twice. `session_bound` marks loads for models already serving an
    /// active session, which survive the critical-pressure bias.
    pub async fn request_load(
        &self,
        model_id: &str,
        session_bound: bool,
    ) -> Result<Arc<ModelHandle>> {
        if let Some(handle) = self.loaded(model_id) {
            handle.touch();
            return Ok(handle);
        }
        // Existence check before taking a transition lock, so unknown ids
        // never allocate one.
        self.inner.registry.require(model_id)?;

        let timeout_secs = self.inner.config.load_timeout_secs;
        let load_timeout = Duration::from_secs(timeout_secs);
        let lock = self.transition_lock(model_id);
        let _transition = tokio::time::timeout(load_timeout, lock.lock())
            .await
            .map_err(|_| CoreError::LoadTimeout {
                model_id: model_id.to_string(),
                timeout_secs,
            })?;

        // A concurrent caller may have finished the load while we waited.
        if let Some(handle) = self.loaded(model_id) {
            handle.touch();
            return Ok(handle);
        }

        let descriptor = self.inner.registry.require(model_id)?;
        if descriptor.status == ModelStatus::Failed {
            return Err(CoreError::EngineLoadFailure {
                model_id: model_id.to_string(),
                message: "previous load failed; re-register the model to retry".into(),
            });
        }

        let request = LoadRequest {
            model_id,
            memory_cost_mb: descriptor.memory_cost_mb,
            accel_cost_mb: descriptor.accel_cost_mb,
            session_bound,
        };
        let decision = policy::decide(
            &request,
            &self.loaded_stats(),
            self.inner.monitor.current_pressure(),
            &self.inner.budget,
        );
        match decision {
            AdmissionDecision::Admit => {}
            AdmissionDecision::AdmitWithEviction(victims) => {
                info!(model_id, ?victims, "evicting to admit load");
                for victim in &victims {
                    self.evict(victim).await?;
                }
            }
            AdmissionDecision::Reject(reason) => return Err(reason.into_error(model_id)),
        }

        self.try_reserve(model_id, descriptor.memory_cost_mb, descriptor.accel_cost_mb)?;
        self.inner
            .registry
            .set_status(model_id, ModelStatus::Loading)?;
        info!(model_id, memory_mb = descriptor.memory_cost_mb, "loading model");

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            load_timeout,
            self.inner
                .engine
                .load(&descriptor.artifact, &self.inner.load_params),
        )
        .await;

        match outcome {
            Ok(Ok(instance)) => {
                let handle = Arc::new(ModelHandle::new(
                    model_id.to_string(),
                    instance,
                    descriptor.memory_cost_mb,
                    descriptor.accel_cost_mb,
                ));
                self.inner
                    .handles
                    .write()
                    .unwrap()
                    .insert(model_id.to_string(), handle.clone());
                self.inner
                    .registry
                    .set_status(model_id, ModelStatus::Loaded)?;
                info!(
                    model_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model loaded"
                );
                Ok(handle)
            }
            Ok(Err(e)) => {
                self.release_reservation(descriptor.memory_cost_mb, descriptor.accel_cost_mb);
                let _ = self.inner.registry.set_status(model_id, ModelStatus::Failed);
                let message = match e {
                    CoreError::EngineFailure { message } => message,
                    other => other.to_string(),
                };
                error!(model_id, %message, "engine load failed");
                Err(CoreError::EngineLoadFailure {
                    model_id: model_id.to_string(),
                    message,
                })
            }
            Err(_) => {
                self.release_reservation(descriptor.memory_cost_mb, descriptor.accel_cost_mb);
                let _ = self
                    .inner
                    .registry
                    .set_status(model_id, ModelStatus::Registered);
                warn!(model_id, timeout_secs, "engine load timed out");
                Err(CoreError::LoadTimeout {
                    model_id: model_id.to_string(),
                    timeout_secs,
                })
            }
        }
    }

    /// Unload a model, or mark it for eviction if requests are in flight;
    /// the final `release` then completes the unload.
    pub async fn request_unload(&self, model_id: &str) -> Result<()> {
        self.inner.registry.require(model_id)?;

        let timeout_secs = self.inner.config.eviction_drain_timeout_secs;
        let lock = self.transition_lock(model_id);
        let _transition = tokio::time::timeout(Duration::from_secs(timeout_secs), lock.lock())
            .await
            .map_err(|_| CoreError::EvictionTimeout {
                model_id: model_id.to_string(),
                timeout_secs,
            })?;

        let handle = match self.loaded(model_id) {
            Some(handle) => handle,
            None => return Ok(()),
        };
        handle.mark_evict_requested();
        if handle.in_flight() == 0 {
            self.finish_unload(&handle).await;
        } else {
            debug!(
                model_id,
                in_flight = handle.in_flight(),
                "unload deferred until in-flight requests drain"
            );
        }
        Ok(())
    }

    /// Evict one victim selected by the policy, waiting (bounded) for its
    /// in-flight requests to drain. Called with the loading model's
    /// transition lock held; takes the victim's lock for the unload.
    async fn evict(&self, victim_id: &str) -> Result<()> {
        let timeout_secs = self.inner.config.eviction_drain_timeout_secs;
        let drain_timeout = Duration::from_secs(timeout_secs);
        let deadline = Instant::now() + drain_timeout;

        let timeout_err = || CoreError::EvictionTimeout {
            model_id: victim_id.to_string(),
            timeout_secs,
        };

        let lock = self.transition_lock(victim_id);
        let _transition = tokio::time::timeout(drain_timeout, lock.lock())
            .await
            .map_err(|_| timeout_err())?;

        let handle = match self.loaded(victim_id) {
            Some(handle) => handle,
            None => return Ok(()), // already unloaded
        };
        handle.mark_evict_requested();

        loop {
            if handle.in_flight() == 0 {
                break;
            }
            let drained = handle.drain_signal();
            if handle.in_flight() == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, drained).await.is_err()
            {
                handle.clear_evict_requested();
                warn!(
                    victim_id,
                    in_flight = handle.in_flight(),
                    "eviction abandoned, victim still busy"
                );
                return Err(timeout_err());
            }
        }

        self.finish_unload(&handle).await;
        Ok(())
    }

    /// Complete an unload for a drained handle. Caller holds the model's
    /// transition lock. Returns false if the handle was resurrected by a
    /// concurrent dispatch or already removed.
    async fn finish_unload(&self, handle: &Arc<ModelHandle>) -> bool {
        let model_id = handle.model_id().to_string();
        let removed = {
            let mut handles = self.inner.handles.write().unwrap();
            if handle.in_flight() > 0 {
                // A dispatch checked out the handle between our drain
                // check and this lock; its release finishes the unload.
                error!(
                    %model_id,
                    in_flight = handle.in_flight(),
                    "refusing to unload a busy handle"
                );
                false
            } else {
                match handles.get(&model_id) {
                    Some(current) if Arc::ptr_eq(current, handle) => {
                        let _ = self
                            .inner
                            .registry
                            .set_status(&model_id, ModelStatus::Unloading);
                        handles.remove(&model_id);
                        true
                    }
                    _ => false,
                }
            }
        };
        if !removed {
            return false;
        }
        self.release_reservation(handle.memory_reserved_mb(), handle.accel_reserved_mb());
        handle.unload_instance().await;
        let _ = self
            .inner
            .registry
            .set_status(&model_id, ModelStatus::Registered);
        info!(%model_id, "model unloaded");
        true
    }

    /// Take an in-flight reference on a handle before dispatch.
    ///
    /// Fails if the handle was unloaded between resolution and dispatch;
    /// the caller resolves again via `request_load`.
    pub fn begin_request(&self, handle: &Arc<ModelHandle>) -> Result<InFlightGuard> {
        let handles = self.inner.handles.read().unwrap();
        match handles.get(handle.model_id()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                handle.begin();
                Ok(InFlightGuard {
                    manager: self.clone(),
                    handle: handle.clone(),
                })
            }
            _ => Err(CoreError::TransitionConflict {
                model_id: handle.model_id().to_string(),
                reason: "handle was unloaded before dispatch".into(),
            }),
        }
    }

    /// Release an in-flight reference, completing a deferred unload when
    /// the counter reaches zero on an eviction-marked handle.
    ///
    /// The completion runs on a spawned task that takes the model's
    /// transition lock, so it neither races an in-flight transition nor
    /// misses one that currently holds the lock.
    pub(crate) fn release(&self, handle: &Arc<ModelHandle>) {
        let remaining = handle.finish();
        if remaining != 0 || !handle.evict_requested() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let manager = self.clone();
                let handle = handle.clone();
                rt.spawn(async move {
                    let lock = manager.transition_lock(handle.model_id());
                    let _transition = lock.lock().await;
                    // A transition that beat us here may have unloaded the
                    // handle already, or the eviction may have been
                    // abandoned; finish_unload re-checks both.
                    if handle.evict_requested() && handle.in_flight() == 0 {
                        manager.finish_unload(&handle).await;
                    }
                });
            }
            Err(_) => {
                // No runtime to finish the unload on; the engine instance
                // goes down with the handle's final drop.
                warn!(
                    model_id = handle.model_id(),
                    "deferred unload has no runtime to complete on"
                );
            }
        }
    }
}
