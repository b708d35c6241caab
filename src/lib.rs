//! diffusion-engine: Stable Diffusion inference on ONNX Runtime.
//!
//! The library is split into the numerical core and the model plumbing:
//!
//! - [`schedulers`]: noise schedules and the PNDM / DPM-Solver++ solvers
//! - [`pipeline`]: the denoising loop ([`StableDiffusionPipeline`])
//! - [`models`]: network contracts and their ONNX Runtime implementations
//! - [`random`]: reproducible Gaussian sources
//! - [`config`]: runtime configuration (EngineConfig, Device)
//! - [`error`]: error types and codes (DiffusionError, ErrorCode)
//!
//! # Example
//!
//! ```rust,ignore
//! use diffusion_engine::{
//!     config::EngineConfig,
//!     models::onnx::load_models,
//!     pipeline::PipelineConfiguration,
//!     schedulers::SchedulerKind,
//! };
//!
//! let engine = EngineConfig::from_env();
//! let mut pipeline = load_models(&engine.effective_model_path(), &engine)?.into_pipeline();
//!
//! let config = PipelineConfiguration {
//!     step_count: 25,
//!     scheduler: SchedulerKind::DpmSolverMultistep,
//!     seed: 93,
//!     ..PipelineConfiguration::new("a lighthouse on a cliff at dusk")
//! };
//! let images = pipeline.generate_images(&config, |progress| {
//!     println!("{}/{}", progress.step + 1, progress.step_count);
//!     true
//! })?;
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod random;
pub mod schedulers;
pub mod tensor;

pub use config::{Device, EngineConfig};
pub use error::{DiffusionError, ErrorCode, ModelKind, Result};
pub use pipeline::{PipelineConfiguration, Progress, StableDiffusionPipeline};
pub use random::{random_source, RandomSource, RngAlgorithm};
pub use schedulers::{create_scheduler, Scheduler, SchedulerKind, TimestepSpacing};
pub use tensor::Tensor;
