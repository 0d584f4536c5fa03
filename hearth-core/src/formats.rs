//! Model artifact format detection.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Artifact formats the appliance knows how to hand to an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    Gguf,
    SafeTensors,
    PyTorch,
    Onnx,
    Unknown,
}

impl ArtifactFormat {
    /// Whether any configured engine can load this format.
    pub fn is_loadable(&self) -> bool {
        !matches!(self, ArtifactFormat::Unknown)
    }
}

impl std::fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactFormat::Gguf => write!(f, "gguf"),
            ArtifactFormat::SafeTensors => write!(f, "safetensors"),
            ArtifactFormat::PyTorch => write!(f, "pytorch"),
            ArtifactFormat::Onnx => write!(f, "onnx"),
            ArtifactFormat::Unknown => write!(f, "unknown"),
        }
    }
}

/// Detect the artifact format from the file extension.
pub fn detect_format(path: &Path) -> ArtifactFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some("gguf") => ArtifactFormat::Gguf,
        Some("safetensors") => ArtifactFormat::SafeTensors,
        Some("pt" | "pth" | "bin") => ArtifactFormat::PyTorch,
        Some("onnx") => ArtifactFormat::Onnx,
        _ => ArtifactFormat::Unknown,
    }
}
