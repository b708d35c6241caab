//! diffusion-engine: Stable Diffusion image generation from the command line.

use std::time::Instant;

use tracing_subscriber::EnvFilter;

use diffusion_engine::cli::Cli;
use diffusion_engine::error::{DiffusionError, ErrorCode, Result};
use diffusion_engine::models::onnx::load_models;

/// Environment variable holding the log filter, e.g. `debug` or
/// `diffusion_engine::schedulers=debug`.
const LOG_ENV: &str = "DIFFUSION_LOG";

fn main() {
    init_tracing();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();
    let engine = cli.engine_config();
    if let Some(reason) = engine.validate() {
        return Err(DiffusionError::invalid_configuration(reason));
    }

    let mut config = cli.pipeline_configuration()?;
    let model_dir = engine.effective_model_path();
    tracing::info!(
        prompt = %config.prompt,
        steps = config.step_count,
        scheduler = %config.scheduler,
        seed = config.seed,
        device = %engine.device,
        model_dir = %model_dir.display(),
        "diffusion-engine"
    );

    let load_start = Instant::now();
    let models = load_models(&model_dir, &engine)?;
    config.encoder_scale_factor = models.metadata.scale_factor;
    config.decoder_scale_factor = models.metadata.scale_factor;
    config.decoder_shift_factor = models.metadata.shift_factor;
    let mut pipeline = models.into_pipeline().with_reduce_memory(cli.reduce_memory);
    tracing::info!(elapsed_sec = load_start.elapsed().as_secs_f32(), "models ready");

    let start_time = Instant::now();
    let images = pipeline.generate_images(&config, |progress| {
        let step = progress.step + 1;
        if step % 5 == 0 || progress.is_last() {
            tracing::info!("Progress: {}/{} steps", step, progress.step_count);
        }
        true
    })?;
    tracing::info!(
        elapsed_sec = start_time.elapsed().as_secs_f32(),
        "generation complete"
    );

    let count = images.len();
    for (index, image) in images.into_iter().enumerate() {
        let Some(image) = image else {
            tracing::warn!(index, "image withheld by safety checker, not written");
            continue;
        };
        let path = cli.output_path(index, count);
        image.save(&path).map_err(|e| {
            DiffusionError::with_source(
                ErrorCode::InvalidConfiguration,
                format!("Failed to write {}", path.display()),
                e,
            )
        })?;
        tracing::info!(path = %path.display(), "saved image");
    }

    Ok(())
}
