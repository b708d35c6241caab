//! Command-line interface for one-shot image generation.

use std::path::{Path, PathBuf};

use clap::builder::TypedValueParser;
use clap::{Parser, ValueEnum};
use image::DynamicImage;

use crate::config::{Device, EngineConfig};
use crate::error::{DiffusionError, ErrorCode, Result};
use crate::pipeline::{PipelineConfiguration, DEFAULT_GUIDANCE_SCALE, DEFAULT_STEP_COUNT};
use crate::random::RngAlgorithm;
use crate::schedulers::{SchedulerKind, TimestepSpacing};

/// Available schedulers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SchedulerArg {
    /// PNDM: pseudo linear multistep, the Stable Diffusion default
    #[default]
    Pndm,
    /// DPM-Solver++: second-order multistep, good results in 15-25 steps
    DpmSolver,
}

impl From<SchedulerArg> for SchedulerKind {
    fn from(arg: SchedulerArg) -> Self {
        match arg {
            SchedulerArg::Pndm => SchedulerKind::Pndm,
            SchedulerArg::DpmSolver => SchedulerKind::DpmSolverMultistep,
        }
    }
}

/// Timestep spacing policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SpacingArg {
    #[default]
    Linspace,
    Leading,
    /// Karras sigmas (DPM-Solver++ only; PNDM falls back to linspace)
    Karras,
}

impl From<SpacingArg> for TimestepSpacing {
    fn from(arg: SpacingArg) -> Self {
        match arg {
            SpacingArg::Linspace => TimestepSpacing::Linspace,
            SpacingArg::Leading => TimestepSpacing::Leading,
            SpacingArg::Karras => TimestepSpacing::Karras,
        }
    }
}

/// Random number generators for the initial noise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum RngArg {
    /// Matches NumPy's legacy `randn` for a given seed
    #[default]
    Numpy,
    /// ChaCha8 stream cipher
    Chacha,
}

impl From<RngArg> for RngAlgorithm {
    fn from(arg: RngArg) -> Self {
        match arg {
            RngArg::Numpy => RngAlgorithm::NumPy,
            RngArg::Chacha => RngAlgorithm::ChaCha,
        }
    }
}

/// Execution device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DeviceArg {
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl From<DeviceArg> for Device {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Auto => Device::Auto,
            DeviceArg::Cpu => Device::Cpu,
            DeviceArg::Cuda => Device::Cuda,
        }
    }
}

/// diffusion-engine: Stable Diffusion image generation with ONNX Runtime
#[derive(Parser, Debug)]
#[command(name = "diffusion-engine")]
#[command(about = "Stable Diffusion text-to-image and image-to-image generation")]
#[command(version)]
pub struct Cli {
    /// Text prompt describing the image to generate
    #[arg(short, long)]
    pub prompt: String,

    /// Text describing what the image should not contain
    #[arg(short, long, default_value = "")]
    pub negative_prompt: String,

    /// Number of denoising steps
    #[arg(long, default_value_t = DEFAULT_STEP_COUNT, value_parser = clap::value_parser!(u16).range(1..=500).map(usize::from))]
    pub steps: usize,

    /// Classifier-free guidance scale; below 1.0 disables guidance
    #[arg(short, long, default_value_t = DEFAULT_GUIDANCE_SCALE)]
    pub guidance: f32,

    /// Number of images to generate
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..).map(usize::from))]
    pub images: usize,

    /// Random seed for reproducible generation
    #[arg(short, long, default_value_t = 0)]
    pub seed: u32,

    /// Random number generator for the initial noise
    #[arg(long, value_enum, default_value_t = RngArg::Numpy)]
    pub rng: RngArg,

    /// Scheduler type
    #[arg(long, value_enum, default_value_t = SchedulerArg::Pndm)]
    pub scheduler: SchedulerArg,

    /// Timestep spacing
    #[arg(long, value_enum, default_value_t = SpacingArg::Linspace)]
    pub spacing: SpacingArg,

    /// Image-to-image strength in (0, 1]
    #[arg(long, default_value_t = 0.8)]
    pub strength: f32,

    /// Starting image for image-to-image generation
    #[arg(long)]
    pub init_image: Option<PathBuf>,

    /// Conditioning image, one per ControlNet in model order
    #[arg(long = "control-image")]
    pub control_images: Vec<PathBuf>,

    /// Skip the safety checker
    #[arg(long)]
    pub disable_safety: bool,

    /// Unload the UNet after generation
    #[arg(long)]
    pub reduce_memory: bool,

    /// Path to directory containing ONNX model files
    #[arg(short, long)]
    pub model_dir: Option<PathBuf>,

    /// Execution device
    #[arg(long, value_enum)]
    pub device: Option<DeviceArg>,

    /// Output PNG file path
    #[arg(short, long, default_value = "output.png")]
    pub output: PathBuf,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Engine settings from the environment, overridden by flags.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::from_env();
        if let Some(ref path) = self.model_dir {
            config.model_path = Some(path.clone());
        }
        if let Some(device) = self.device {
            config.device = device.into();
        }
        config
    }

    /// Builds the per-run configuration, loading any input images.
    pub fn pipeline_configuration(&self) -> Result<PipelineConfiguration> {
        let starting_image = self.init_image.as_deref().map(open_image).transpose()?;
        let control_net_inputs = self
            .control_images
            .iter()
            .map(|path| open_image(path))
            .collect::<Result<Vec<_>>>()?;

        Ok(PipelineConfiguration {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            step_count: self.steps,
            guidance_scale: self.guidance,
            image_count: self.images,
            seed: self.seed,
            rng: self.rng.into(),
            strength: if starting_image.is_some() {
                self.strength
            } else {
                1.0
            },
            scheduler: self.scheduler.into(),
            timestep_spacing: self.spacing.into(),
            disable_safety: self.disable_safety,
            starting_image,
            control_net_inputs,
            ..PipelineConfiguration::default()
        })
    }

    /// Path for the `index`-th of `count` images.
    ///
    /// A single image is written to `--output` as given; batches insert the
    /// index before the extension (`output.0.png`, `output.1.png`, ...).
    pub fn output_path(&self, index: usize, count: usize) -> PathBuf {
        if count <= 1 {
            return self.output.clone();
        }
        let stem = self
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let extension = self
            .output
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "png".to_string());
        self.output
            .with_file_name(format!("{}.{}.{}", stem, index, extension))
    }
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|e| {
        DiffusionError::with_source(
            ErrorCode::InvalidConfiguration,
            format!("Failed to read image {}", path.display()),
            e,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["diffusion-engine"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_pipeline_defaults() {
        let cli = parse(&["--prompt", "a red barn"]);
        assert_eq!(cli.steps, 50);
        assert_eq!(cli.guidance, 7.5);
        assert_eq!(cli.images, 1);
        assert_eq!(cli.scheduler, SchedulerArg::Pndm);
        assert_eq!(cli.output, PathBuf::from("output.png"));

        let config = cli.pipeline_configuration().unwrap();
        assert_eq!(config.prompt, "a red barn");
        assert_eq!(config.strength, 1.0);
        assert_eq!(config.scheduler, SchedulerKind::Pndm);
        assert_eq!(config.rng, RngAlgorithm::NumPy);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_solver_options() {
        let cli = parse(&[
            "-p",
            "fog",
            "--scheduler",
            "dpm-solver",
            "--spacing",
            "karras",
            "--rng",
            "chacha",
            "--steps",
            "20",
            "--images",
            "3",
            "--seed",
            "42",
        ]);
        let config = cli.pipeline_configuration().unwrap();
        assert_eq!(config.scheduler, SchedulerKind::DpmSolverMultistep);
        assert_eq!(config.timestep_spacing, TimestepSpacing::Karras);
        assert_eq!(config.rng, RngAlgorithm::ChaCha);
        assert_eq!(config.step_count, 20);
        assert_eq!(config.image_count, 3);
        assert_eq!(config.seed, 42);
    }

    #[test]
    fn rejects_out_of_range_steps() {
        assert!(Cli::try_parse_from(["diffusion-engine", "-p", "x", "--steps", "0"]).is_err());
        assert!(Cli::try_parse_from(["diffusion-engine", "-p", "x", "--steps", "501"]).is_err());
        assert!(Cli::try_parse_from(["diffusion-engine", "--steps", "10"]).is_err());
    }

    #[test]
    fn missing_init_image_is_reported() {
        let cli = parse(&["-p", "x", "--init-image", "/nonexistent/start.png"]);
        let err = cli.pipeline_configuration().unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn init_image_enables_strength() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("start.png");
        DynamicImage::new_rgb8(8, 8).save(&path).unwrap();

        let cli = parse(&[
            "-p",
            "x",
            "--init-image",
            path.to_str().unwrap(),
            "--strength",
            "0.6",
            "--control-image",
            path.to_str().unwrap(),
        ]);
        let config = cli.pipeline_configuration().unwrap();
        assert!(config.starting_image.is_some());
        assert_eq!(config.strength, 0.6);
        assert_eq!(config.control_net_inputs.len(), 1);
    }

    #[test]
    fn output_paths_for_batches() {
        let cli = parse(&["-p", "x", "-o", "out/lighthouse.png"]);
        assert_eq!(cli.output_path(0, 1), PathBuf::from("out/lighthouse.png"));
        assert_eq!(cli.output_path(0, 2), PathBuf::from("out/lighthouse.0.png"));
        assert_eq!(cli.output_path(1, 2), PathBuf::from("out/lighthouse.1.png"));
    }

    #[test]
    fn flags_override_engine_config() {
        let cli = parse(&["-p", "x", "--model-dir", "/models/sd", "--device", "cpu"]);
        let engine = cli.engine_config();
        assert_eq!(engine.model_path, Some(PathBuf::from("/models/sd")));
        assert_eq!(engine.device, Device::Cpu);
    }
}
