//! Resource monitoring and pressure classification.
//!
//! A background task samples system usage on a fixed interval and keeps a
//! short window of snapshots for trend smoothing. Readers get the latest
//! snapshot and a pressure classification without blocking. If sampling
//! stops producing fresh data, pressure is forced to `Critical` so the
//! admission policy rejects new loads instead of trusting stale numbers.

use crate::config::{MonitorConfig, ResourceBudget};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Qualitative resource-scarcity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pressure {
    Normal,
    Warning,
    Critical,
}

impl std::fmt::Display for Pressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pressure::Normal => write!(f, "normal"),
            Pressure::Warning => write!(f, "warning"),
            Pressure::Critical => write!(f, "critical"),
        }
    }
}

/// A single timestamped resource measurement. Immutable once produced.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub taken_at: DateTime<Utc>,
    /// CPU utilization as a fraction in [0, 1].
    pub cpu_fraction: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub accel_used_mb: u64,
    pub accel_total_mb: u64,
    pub disk_free_mb: u64,
}

impl ResourceSnapshot {
    pub fn memory_fraction(&self) -> f64 {
        if self.memory_total_mb == 0 {
            0.0
        } else {
            self.memory_used_mb as f64 / self.memory_total_mb as f64
        }
    }

    pub fn accel_fraction(&self) -> f64 {
        if self.accel_total_mb == 0 {
            0.0
        } else {
            self.accel_used_mb as f64 / self.accel_total_mb as f64
        }
    }
}

/// Source of resource measurements.
///
/// The production implementation reads the host via `sysinfo`; tests
/// inject deterministic samplers. An accelerator-aware deployment wires
/// its probe in by implementing this trait.
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> Result<ResourceSnapshot>;
}

/// Host sampler backed by `sysinfo`.
///
/// Reports accelerator totals from configuration with zero usage; a real
/// accelerator probe replaces this sampler entirely.
pub struct SystemSampler {
    system: sysinfo::System,
    disks: sysinfo::Disks,
    accel_total_mb: u64,
}

impl SystemSampler {
    pub fn new(accel_total_mb: u64) -> Self {
        let system = sysinfo::System::new_with_specifics(
            sysinfo::RefreshKind::new()
                .with_memory(sysinfo::MemoryRefreshKind::everything())
                .with_cpu(sysinfo::CpuRefreshKind::everything()),
        );
        let disks = sysinfo::Disks::new_with_refreshed_list();
        Self {
            system,
            disks,
            accel_total_mb,
        }
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&mut self) -> Result<ResourceSnapshot> {
        const MB: u64 = 1024 * 1024;
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();
        self.disks.refresh();

        Ok(ResourceSnapshot {
            taken_at: Utc::now(),
            cpu_fraction: (self.system.global_cpu_usage() as f64 / 100.0).clamp(0.0, 1.0),
            memory_used_mb: self.system.used_memory() / MB,
            memory_total_mb: self.system.total_memory() / MB,
            accel_used_mb: 0,
            accel_total_mb: self.accel_total_mb,
            disk_free_mb: self
                .disks
                .iter()
                .map(|d| d.available_space())
                .max()
                .unwrap_or(0)
                / MB,
        })
    }
}

struct MonitorState {
    window: VecDeque<ResourceSnapshot>,
    pressure: Pressure,
    last_sample: Option<Instant>,
}

struct MonitorInner {
    budget: ResourceBudget,
    config: MonitorConfig,
    started: Instant,
    state: RwLock<MonitorState>,
}

/// Single-writer, multi-reader view of current resource state.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
}

impl ResourceMonitor {
    pub fn new(budget: ResourceBudget, config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                budget,
                config,
                started: Instant::now(),
                state: RwLock::new(MonitorState {
                    window: VecDeque::new(),
                    pressure: Pressure::Normal,
                    last_sample: None,
                }),
            }),
        }
    }

    /// Record a fresh snapshot and reclassify pressure over the window.
    pub fn record(&self, snapshot: ResourceSnapshot) {
        let mut state = self.inner.state.write().unwrap();
        state.window.push_back(snapshot);
        while state.window.len() > self.inner.config.window.max(1) {
            state.window.pop_front();
        }
        state.last_sample = Some(Instant::now());

        let pressure = classify(&state.window, &self.inner.budget);
        if pressure != state.pressure {
            info!(from = %state.pressure, to = %pressure, "resource pressure changed");
            state.pressure = pressure;
        }
    }

    /// Latest snapshot, if any sample has succeeded yet.
    pub fn snapshot(&self) -> Option<ResourceSnapshot> {
        self.inner.state.read().unwrap().window.back().cloned()
    }

    /// Latest snapshot, refusing stale data.
    pub fn fresh_snapshot(&self) -> Result<ResourceSnapshot> {
        if self.is_stale() {
            return Err(CoreError::StaleResourceData);
        }
        self.snapshot().ok_or(CoreError::StaleResourceData)
    }

    /// Whether the last successful sample is older than the staleness timeout.
    pub fn is_stale(&self) -> bool {
        let staleness = Duration::from_secs(self.inner.config.staleness_timeout_secs);
        let state = self.inner.state.read().unwrap();
        match state.last_sample {
            Some(at) => at.elapsed() > staleness,
            // Startup grace: one staleness window to produce the first sample.
            None => self.inner.started.elapsed() > staleness,
        }
    }

    /// Current pressure; forced to `Critical` when data is stale.
    pub fn current_pressure(&self) -> Pressure {
        if self.is_stale() {
            return Pressure::Critical;
        }
        self.inner.state.read().unwrap().pressure
    }

    /// Spawn the periodic sampling loop. The loop stops when `cancel`
    /// fires, letting any in-flight sample finish first.
    pub fn spawn_sampling_task(
        &self,
        mut sampler: Box<dyn ResourceSampler>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        let period = Duration::from_secs(self.inner.config.sample_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match sampler.sample() {
                        Ok(snapshot) => monitor.record(snapshot),
                        Err(e) => warn!("resource sample failed: {e}"),
                    },
                }
            }
            debug!("resource monitor loop stopped");
        })
    }
}

/// Classify pressure from the smoothed (mean) usage over the window,
/// taking whichever of memory and accelerator is more constrained.
fn classify(window: &VecDeque<ResourceSnapshot>, budget: &ResourceBudget) -> Pressure {
    if window.is_empty() {
        return Pressure::Normal;
    }
    let n = window.len() as f64;
    let mem = window.iter().map(|s| s.memory_fraction()).sum::<f64>() / n;
    let accel = window.iter().map(|s| s.accel_fraction()).sum::<f64>() / n;
    let usage = mem.max(accel);

    if usage >= budget.critical_threshold {
        Pressure::Critical
    } else if usage >= budget.warning_threshold {
        Pressure::Warning
    } else {
        Pressure::Normal
    }
}
