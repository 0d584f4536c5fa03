//! Admission and eviction policy.
//!
//! A pure decision function: given a load request, the currently loaded
//! set, current pressure, and the static budget, decide whether to admit,
//! admit after evicting victims, or reject. No locks, no clocks, no
//! side effects; the lifecycle manager executes whatever is decided here.

use crate::config::ResourceBudget;
use crate::error::CoreError;
use crate::monitor::Pressure;
use serde::Serialize;

/// A request to load a model, as seen by the policy.
#[derive(Debug, Clone)]
pub struct LoadRequest<'a> {
    pub model_id: &'a str,
    pub memory_cost_mb: u64,
    pub accel_cost_mb: u64,
    /// Whether this model is already bound to an active session. Under
    /// critical pressure only such loads are considered, so existing
    /// sessions can drain while new work is shed.
    pub session_bound: bool,
}

/// Point-in-time stats for one loaded handle.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedModelStats {
    pub model_id: String,
    pub memory_reserved_mb: u64,
    pub accel_reserved_mb: u64,
    pub in_flight: u64,
    /// Last activity as unix milliseconds; the LRU ordering key.
    pub last_active_ms: i64,
}

/// Outcome of an admission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    /// Admit once the named victims (in order) are unloaded.
    AdmitWithEviction(Vec<String>),
    Reject(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InsufficientResources { needed_mb: u64, reclaimable_mb: u64 },
    SystemUnderPressure,
}

impl RejectReason {
    pub fn into_error(self, model_id: &str) -> CoreError {
        match self {
            RejectReason::InsufficientResources {
                needed_mb,
                reclaimable_mb,
            } => CoreError::InsufficientResources {
                model_id: model_id.to_string(),
                needed_mb,
                reclaimable_mb,
            },
            RejectReason::SystemUnderPressure => CoreError::SystemUnderPressure {
                model_id: model_id.to_string(),
            },
        }
    }
}

/// Decide whether a load may proceed, and at whose expense.
pub fn decide(
    request: &LoadRequest<'_>,
    loaded: &[LoadedModelStats],
    pressure: Pressure,
    budget: &ResourceBudget,
) -> AdmissionDecision {
    // Hot path: the model is already resident.
    if loaded.iter().any(|m| m.model_id == request.model_id) {
        return AdmissionDecision::Admit;
    }

    if pressure == Pressure::Critical && !request.session_bound {
        return AdmissionDecision::Reject(RejectReason::SystemUnderPressure);
    }

    let reserved_mem: u64 = loaded.iter().map(|m| m.memory_reserved_mb).sum();
    let reserved_accel: u64 = loaded.iter().map(|m| m.accel_reserved_mb).sum();
    let count = loaded.len();

    let fits = |freed_mem: u64, freed_accel: u64, evicted: usize| {
        reserved_mem - freed_mem + request.memory_cost_mb <= budget.max_memory_mb
            && reserved_accel - freed_accel + request.accel_cost_mb <= budget.max_accel_memory_mb
            && count - evicted + 1 <= budget.max_concurrent_models
    };

    if fits(0, 0, 0) {
        return AdmissionDecision::Admit;
    }

    // Victim candidates: idle handles only, least recently used first,
    // ties broken by larger footprint to free more headroom per eviction.
    let mut candidates: Vec<&LoadedModelStats> =
        loaded.iter().filter(|m| m.in_flight == 0).collect();
    candidates.sort_by(|a, b| {
        a.last_active_ms
            .cmp(&b.last_active_ms)
            .then_with(|| b.memory_reserved_mb.cmp(&a.memory_reserved_mb))
    });

    let mut victims = Vec::new();
    let mut freed_mem = 0u64;
    let mut freed_accel = 0u64;
    for candidate in candidates {
        if fits(freed_mem, freed_accel, victims.len()) {
            break;
        }
        freed_mem += candidate.memory_reserved_mb;
        freed_accel += candidate.accel_reserved_mb;
        victims.push(candidate.model_id.clone());
    }

    if fits(freed_mem, freed_accel, victims.len()) {
        AdmissionDecision::AdmitWithEviction(victims)
    } else {
        AdmissionDecision::Reject(RejectReason::InsufficientResources {
            needed_mb: request.memory_cost_mb,
            reclaimable_mb: freed_mem,
        })
    }
}
