//! Error types for the diffusion engine.
//!
//! Every failure inside the denoising loop propagates synchronously to the
//! caller and aborts the run. Cancellation through the progress handler is not
//! an error and is reported as an empty result instead.

use std::fmt;

/// Error codes identifying the category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed or missing model metadata, or an unexpected tensor shape.
    InvalidConfiguration,

    /// A model call failed while running.
    /// The failing model is recorded on the error.
    ModelExecutionFailed,

    /// Tensors could not be marshalled into a model-call input.
    FeatureEncodingFailed,

    /// A requested feature needs a collaborator that is not attached.
    /// Trigger: image-to-image without a VAE encoder.
    MissingDependency,

    /// Model files not found at the expected path.
    ModelNotFound,

    /// Model file exists but could not be loaded.
    ModelLoadFailed,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfiguration => "INVALID_CONFIGURATION",
            ErrorCode::ModelExecutionFailed => "MODEL_EXECUTION_FAILED",
            ErrorCode::FeatureEncodingFailed => "FEATURE_ENCODING_FAILED",
            ErrorCode::MissingDependency => "MISSING_DEPENDENCY",
            ErrorCode::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorCode::ModelLoadFailed => "MODEL_LOAD_FAILED",
        }
    }

    /// Returns a human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfiguration => "Configuration or model metadata is invalid",
            ErrorCode::ModelExecutionFailed => "A model failed during execution",
            ErrorCode::FeatureEncodingFailed => "Tensors could not be converted into model inputs",
            ErrorCode::MissingDependency => "A required model is not attached to the pipeline",
            ErrorCode::ModelNotFound => "Model files not found at expected path",
            ErrorCode::ModelLoadFailed => "Failed to load model into memory",
        }
    }

    /// Returns a recovery hint suggesting how to resolve this error.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfiguration => {
                "Check the generation parameters and the model directory's config.json"
            }
            ErrorCode::ModelExecutionFailed => {
                "Retry with a fresh pipeline run, reduce image count, or switch to CPU \
                 with DIFFUSION_DEVICE=cpu"
            }
            ErrorCode::FeatureEncodingFailed => {
                "Verify the models were exported with the expected input names and shapes"
            }
            ErrorCode::MissingDependency => {
                "Provide the missing model file (e.g. vae_encoder.onnx for image-to-image)"
            }
            ErrorCode::ModelNotFound => {
                "Point --model-dir or DIFFUSION_MODEL_PATH at a directory with the exported models"
            }
            ErrorCode::ModelLoadFailed => {
                "Check available memory and verify the model files are not corrupted"
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which external model a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    TextEncoder,
    TextEncoder2,
    Unet,
    UnetRefiner,
    ControlNet,
    VaeEncoder,
    VaeDecoder,
    SafetyChecker,
}

impl ModelKind {
    /// Returns the string name of this model.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::TextEncoder => "text_encoder",
            ModelKind::TextEncoder2 => "text_encoder_2",
            ModelKind::Unet => "unet",
            ModelKind::UnetRefiner => "unet_refiner",
            ModelKind::ControlNet => "controlnet",
            ModelKind::VaeEncoder => "vae_encoder",
            ModelKind::VaeDecoder => "vae_decoder",
            ModelKind::SafetyChecker => "safety_checker",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for engine operations.
#[derive(Debug)]
pub struct DiffusionError {
    /// The error code identifying the type of error.
    pub code: ErrorCode,
    /// Human-readable error message with context.
    pub message: String,
    /// The model involved, if any.
    pub model: Option<ModelKind>,
    /// Optional underlying cause of the error.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DiffusionError {
    /// Creates a new DiffusionError with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            model: None,
            source: None,
        }
    }

    /// Creates a new DiffusionError with an underlying cause.
    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            model: None,
            source: Some(Box::new(source)),
        }
    }

    /// Attaches the model the error originated from.
    pub fn for_model(mut self, model: ModelKind) -> Self {
        self.model = Some(model);
        self
    }

    /// Creates an INVALID_CONFIGURATION error.
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, reason)
    }

    /// Creates a MODEL_EXECUTION_FAILED error for the given model.
    pub fn model_execution_failed(model: ModelKind, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ModelExecutionFailed,
            format!("{} failed: {}", model, reason.into()),
        )
        .for_model(model)
    }

    /// Creates a FEATURE_ENCODING_FAILED error for the given model.
    pub fn feature_encoding_failed(model: ModelKind, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::FeatureEncodingFailed,
            format!("Could not build {} input: {}", model, reason.into()),
        )
        .for_model(model)
    }

    /// Creates a MISSING_DEPENDENCY error.
    pub fn missing_dependency(model: ModelKind, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::MissingDependency,
            format!("{} is required: {}", model, reason.into()),
        )
        .for_model(model)
    }

    /// Creates a MODEL_NOT_FOUND error.
    pub fn model_not_found(path: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ModelNotFound,
            format!("Model files not found at: {}", path.into()),
        )
    }

    /// Creates a MODEL_LOAD_FAILED error.
    pub fn model_load_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ModelLoadFailed,
            format!("Failed to load model: {}", reason.into()),
        )
    }
}

impl fmt::Display for DiffusionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}. Recovery: {}",
            self.code,
            self.message,
            self.code.recovery_hint()
        )
    }
}

impl std::error::Error for DiffusionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Result type alias using DiffusionError.
pub type Result<T> = std::result::Result<T, DiffusionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_as_str() {
        assert_eq!(ErrorCode::InvalidConfiguration.as_str(), "INVALID_CONFIGURATION");
        assert_eq!(ErrorCode::ModelExecutionFailed.as_str(), "MODEL_EXECUTION_FAILED");
        assert_eq!(ErrorCode::FeatureEncodingFailed.as_str(), "FEATURE_ENCODING_FAILED");
        assert_eq!(ErrorCode::MissingDependency.as_str(), "MISSING_DEPENDENCY");
        assert_eq!(ErrorCode::ModelNotFound.as_str(), "MODEL_NOT_FOUND");
        assert_eq!(ErrorCode::ModelLoadFailed.as_str(), "MODEL_LOAD_FAILED");
    }

    #[test]
    fn error_code_recovery_hints_not_empty() {
        for code in [
            ErrorCode::InvalidConfiguration,
            ErrorCode::ModelExecutionFailed,
            ErrorCode::FeatureEncodingFailed,
            ErrorCode::MissingDependency,
            ErrorCode::ModelNotFound,
            ErrorCode::ModelLoadFailed,
        ] {
            assert!(!code.recovery_hint().is_empty());
            assert!(!code.description().is_empty());
        }
    }

    #[test]
    fn model_execution_error_records_model() {
        let err = DiffusionError::model_execution_failed(ModelKind::Unet, "out of memory");
        assert_eq!(err.code, ErrorCode::ModelExecutionFailed);
        assert_eq!(err.model, Some(ModelKind::Unet));
        assert!(err.to_string().contains("unet failed: out of memory"));
    }

    #[test]
    fn missing_dependency_display() {
        let err = DiffusionError::missing_dependency(ModelKind::VaeEncoder, "image-to-image");
        let text = err.to_string();
        assert!(text.contains("MISSING_DEPENDENCY"));
        assert!(text.contains("vae_encoder"));
        assert!(text.contains("Recovery:"));
    }

    #[test]
    fn source_is_exposed() {
        use std::error::Error;
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let err = DiffusionError::with_source(ErrorCode::ModelLoadFailed, "read failed", io);
        assert!(err.source().is_some());
    }
}
