//! Model registry — durable record of known model descriptors.
//!
//! Tracks every model the appliance knows about, loaded or not. Lookups
//! are read-mostly: readers clone an `Arc` of the whole map out of a
//! briefly-held lock and then work lock-free; writers rebuild the map and
//! swap the `Arc`. Status mutation is reserved for the lifecycle manager.

use crate::error::{CoreError, Result};
use crate::formats::{ArtifactFormat, detect_format};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Lifecycle status of a registered model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Registered,
    Downloading,
    Ready,
    Loading,
    Loaded,
    Unloading,
    Failed,
}

impl ModelStatus {
    /// Whether a loaded handle exists or a transition is in flight,
    /// which blocks replacement and removal.
    pub fn is_resident(&self) -> bool {
        matches!(
            self,
            ModelStatus::Loading | ModelStatus::Loaded | ModelStatus::Unloading
        )
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelStatus::Registered => write!(f, "registered"),
            ModelStatus::Downloading => write!(f, "downloading"),
            ModelStatus::Ready => write!(f, "ready"),
            ModelStatus::Loading => write!(f, "loading"),
            ModelStatus::Loaded => write!(f, "loaded"),
            ModelStatus::Unloading => write!(f, "unloading"),
            ModelStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Descriptor for a known model, independent of load state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique model identifier.
    pub id: String,
    /// On-disk artifact location.
    pub artifact: PathBuf,
    pub format: ArtifactFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    /// Estimated resident memory cost when loaded, in MB.
    pub memory_cost_mb: u64,
    /// Estimated accelerator memory cost when loaded, in MB.
    pub accel_cost_mb: u64,
    pub status: ModelStatus,
    pub registered_at: DateTime<Utc>,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, artifact: impl Into<PathBuf>, memory_cost_mb: u64) -> Self {
        let artifact = artifact.into();
        let format = detect_format(&artifact);
        Self {
            id: id.into(),
            artifact,
            format,
            parameter_count: None,
            quantization: None,
            memory_cost_mb,
            accel_cost_mb: 0,
            status: ModelStatus::Registered,
            registered_at: Utc::now(),
        }
    }

    pub fn with_accel_cost(mut self, accel_cost_mb: u64) -> Self {
        self.accel_cost_mb = accel_cost_mb;
        self
    }

    pub fn with_quantization(mut self, quantization: impl Into<String>) -> Self {
        self.quantization = Some(quantization.into());
        self
    }

    pub fn with_parameter_count(mut self, parameter_count: u64) -> Self {
        self.parameter_count = Some(parameter_count);
        self
    }
}

type DescriptorMap = HashMap<String, Arc<ModelDescriptor>>;

/// Registry of known models.
pub struct ModelRegistry {
    models: RwLock<Arc<DescriptorMap>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    fn map(&self) -> Arc<DescriptorMap> {
        self.models.read().unwrap().clone()
    }

    fn update_map(&self, f: impl FnOnce(&mut DescriptorMap)) {
        let mut guard = self.models.write().unwrap();
        let mut map = (**guard).clone();
        f(&mut map);
        *guard = Arc::new(map);
    }

    /// Register a new model. Fails on duplicate ids and unreadable or
    /// unrecognized artifacts.
    pub fn register(&self, descriptor: ModelDescriptor) -> Result<()> {
        self.validate(&descriptor)?;
        if self.map().contains_key(&descriptor.id) {
            return Err(CoreError::ModelAlreadyRegistered {
                model_id: descriptor.id,
            });
        }
        self.insert(descriptor);
        Ok(())
    }

    /// Register a model, replacing any prior descriptor, unless that
    /// descriptor currently has a loaded handle or an in-flight
    /// transition.
    pub fn register_force(&self, descriptor: ModelDescriptor) -> Result<()> {
        self.validate(&descriptor)?;
        if let Some(existing) = self.map().get(&descriptor.id) {
            if existing.status.is_resident() {
                return Err(CoreError::TransitionConflict {
                    model_id: descriptor.id,
                    reason: format!("cannot replace a {} model", existing.status),
                });
            }
            info!(model_id = %descriptor.id, "replacing registered model");
        }
        self.insert(descriptor);
        Ok(())
    }

    fn validate(&self, descriptor: &ModelDescriptor) -> Result<()> {
        if descriptor.id.trim().is_empty() {
            return Err(CoreError::InvalidDescriptor {
                model_id: descriptor.id.clone(),
                reason: "id must not be empty".into(),
            });
        }
        if !descriptor.format.is_loadable() {
            return Err(CoreError::InvalidDescriptor {
                model_id: descriptor.id.clone(),
                reason: format!("unrecognized artifact format: {}", descriptor.artifact.display()),
            });
        }
        let readable = std::fs::metadata(&descriptor.artifact)
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !readable {
            return Err(CoreError::ArtifactUnreadable {
                path: descriptor.artifact.clone(),
            });
        }
        Ok(())
    }

    fn insert(&self, mut descriptor: ModelDescriptor) {
        descriptor.status = ModelStatus::Registered;
        debug!(model_id = %descriptor.id, format = %descriptor.format, "model registered");
        self.update_map(|map| {
            map.insert(descriptor.id.clone(), Arc::new(descriptor));
        });
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<ModelDescriptor>> {
        self.map().get(model_id).cloned()
    }

    pub fn require(&self, model_id: &str) -> Result<Arc<ModelDescriptor>> {
        self.get(model_id).ok_or_else(|| CoreError::UnknownModel {
            model_id: model_id.to_string(),
        })
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.map().contains_key(model_id)
    }

    /// All descriptors, sorted by id for stable output.
    pub fn list(&self) -> Vec<Arc<ModelDescriptor>> {
        let mut models: Vec<_> = self.map().values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Remove a descriptor. Refused while a loaded handle or pending
    /// transition references it.
    pub fn remove(&self, model_id: &str) -> Result<()> {
        let descriptor = self.require(model_id)?;
        if descriptor.status.is_resident() {
            return Err(CoreError::TransitionConflict {
                model_id: model_id.to_string(),
                reason: format!("cannot remove a {} model", descriptor.status),
            });
        }
        self.update_map(|map| {
            map.remove(model_id);
        });
        Ok(())
    }

    /// Update a model's lifecycle status. Lifecycle-manager use only.
    pub(crate) fn set_status(&self, model_id: &str, status: ModelStatus) -> Result<()> {
        let descriptor = self.require(model_id)?;
        debug!(model_id, from = %descriptor.status, to = %status, "model status");
        let mut updated = (*descriptor).clone();
        updated.status = status;
        self.update_map(|map| {
            map.insert(model_id.to_string(), Arc::new(updated));
        });
        Ok(())
    }

    /// Scan a directory and register every recognizable artifact not
    /// already known, deriving the memory estimate from file size.
    /// Returns the number of models registered.
    pub fn scan_directory(&self, dir: &Path) -> usize {
        let mut count = 0;
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), "model scan failed: {e}");
                return 0;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !detect_format(&path).is_loadable() {
                continue;
            }
            let id = match path.file_stem() {
                Some(stem) => stem.to_string_lossy().to_string(),
                None => continue,
            };
            if self.contains(&id) {
                continue;
            }
            let size_mb = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0) / (1024 * 1024);
            // Resident cost roughly tracks artifact size, plus headroom
            // for context buffers.
            let memory_cost_mb = size_mb + size_mb / 10 + 256;
            if self
                .register(ModelDescriptor::new(id, path, memory_cost_mb))
                .is_ok()
            {
                count += 1;
            }
        }
        if count > 0 {
            info!(dir = %dir.display(), count, "registered models from scan");
        }
        count
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
