//! Engine runtime configuration.
//!
//! Contains the settings that decide where models are loaded from and how
//! ONNX Runtime executes them. Per-generation parameters live in
//! [`PipelineConfiguration`](crate::pipeline::PipelineConfiguration).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Execution device for ONNX inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Try CUDA and fall back to CPU when it is unavailable.
    #[default]
    Auto,

    /// Force CPU execution.
    Cpu,

    /// Require CUDA for NVIDIA GPU acceleration.
    Cuda,
}

impl Device {
    /// Returns the string representation of the device.
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Auto => "auto",
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
        }
    }

    /// Parses a device from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Device::Auto),
            "cpu" => Some(Device::Cpu),
            "cuda" | "gpu" => Some(Device::Cuda),
            _ => None,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime configuration for the engine.
///
/// Loaded from environment variables at startup; command-line flags
/// override individual fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Directory containing the exported ONNX models.
    /// If None, uses the platform-specific default cache location.
    pub model_path: Option<PathBuf>,

    /// Execution device for inference.
    pub device: Device,

    /// Number of threads for intra-op parallelism in ONNX Runtime.
    /// If None, uses ONNX Runtime's default.
    pub threads: Option<usize>,
}

impl EngineConfig {
    /// Creates a new EngineConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an EngineConfig from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `DIFFUSION_MODEL_PATH` - Path to the model directory
    /// - `DIFFUSION_DEVICE` - Device selection (auto, cpu, cuda)
    /// - `DIFFUSION_THREADS` - Number of intra-op threads
    ///
    /// Falls back to defaults for unset or unparsable variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("DIFFUSION_MODEL_PATH") {
            config.model_path = Some(PathBuf::from(path));
        }

        if let Ok(device_str) = std::env::var("DIFFUSION_DEVICE") {
            match Device::parse(&device_str) {
                Some(device) => config.device = device,
                None => tracing::warn!(value = %device_str, "ignoring unknown DIFFUSION_DEVICE"),
            }
        }

        if let Ok(threads_str) = std::env::var("DIFFUSION_THREADS") {
            if let Ok(threads) = threads_str.parse::<usize>() {
                if threads > 0 {
                    config.threads = Some(threads);
                }
            }
        }

        config
    }

    /// Returns the effective model path, using platform defaults if not specified.
    pub fn effective_model_path(&self) -> PathBuf {
        match self.model_path {
            Some(ref path) => path.clone(),
            None => default_model_path(),
        }
    }

    /// Validates the configuration.
    ///
    /// Returns an error message if validation fails, None otherwise.
    pub fn validate(&self) -> Option<String> {
        if let Some(threads) = self.threads {
            if threads == 0 {
                return Some("threads must be > 0".to_string());
            }
            if threads > 256 {
                return Some(format!("threads too high: {} (max 256)", threads));
            }
        }

        None
    }
}

/// Returns the platform-specific default model storage path.
///
/// - macOS: ~/Library/Caches/diffusion-engine/models
/// - Linux: ~/.cache/diffusion-engine/models
/// - Windows: C:\Users\<user>\AppData\Local\diffusion-engine\cache\models
fn default_model_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "diffusion-engine") {
        proj_dirs.cache_dir().join("models")
    } else {
        PathBuf::from("./models")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_parsing() {
        assert_eq!(Device::parse("auto"), Some(Device::Auto));
        assert_eq!(Device::parse("CPU"), Some(Device::Cpu));
        assert_eq!(Device::parse("cuda"), Some(Device::Cuda));
        assert_eq!(Device::parse("gpu"), Some(Device::Cuda));
        assert_eq!(Device::parse("metal"), None);
    }

    #[test]
    fn device_display() {
        assert_eq!(Device::Auto.to_string(), "auto");
        assert_eq!(Device::Cpu.to_string(), "cpu");
    }

    #[test]
    fn config_validation() {
        let mut config = EngineConfig::new();
        assert!(config.validate().is_none());

        config.threads = Some(0);
        assert!(config.validate().is_some());

        config.threads = Some(512);
        assert!(config.validate().is_some());

        config.threads = Some(4);
        assert!(config.validate().is_none());
    }

    #[test]
    fn explicit_model_path_wins() {
        let mut config = EngineConfig::new();
        assert!(!config.effective_model_path().as_os_str().is_empty());

        config.model_path = Some(PathBuf::from("/opt/models/sd15"));
        assert_eq!(config.effective_model_path(), PathBuf::from("/opt/models/sd15"));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = EngineConfig {
            model_path: Some(PathBuf::from("models")),
            device: Device::Cpu,
            threads: Some(8),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"cpu\""));
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.device, Device::Cpu);
        assert_eq!(parsed.threads, Some(8));
    }
}
