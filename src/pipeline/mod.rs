//! The denoising loop.
//!
//! [`StableDiffusionPipeline`] owns every network and drives one scheduler per
//! image through the timestep schedule in lockstep:
//!
//! 1. Encode the prompts (and, for XL, build size conditioning).
//! 2. Draw initial noise, or encode and noise a starting image.
//! 3. Per step: optional guidance duplication, ControlNet residuals, noise
//!    prediction, guidance, scheduler update, progress callback.
//! 4. Decode the final latents and run the safety checker.

pub mod configuration;
pub mod controlnet;
pub mod guidance;
pub mod image;
pub mod latents;
pub mod progress;

use ::image::RgbImage;
use ndarray::{arr2, concatenate, Axis};

use crate::error::{DiffusionError, ModelKind, Result};
use crate::models::{
    ControlNet, ImageDecoder, ImageEncoder, NoiseConditioning, NoisePredictor, Residuals,
    SafetyChecker, TextEmbedding, TextEncoder,
};
use crate::random::random_source;
use crate::schedulers::{create_scheduler, DynScheduler, Scheduler};
use crate::tensor::{concat_batch, split_batch, Tensor};

pub use configuration::{
    PipelineConfiguration, PipelineMode, XlConditioning, DEFAULT_GUIDANCE_SCALE,
    DEFAULT_SCALE_FACTOR, DEFAULT_STEP_COUNT, MAX_STEP_COUNT,
};
pub use progress::Progress;

use controlnet::{prepare_conditions, run_control_nets, LATENT_DOWNSCALE};
use guidance::{duplicate_for_guidance, perform_guidance};
use latents::{initial_noise, sample_latent, unscale_latents};

/// Conditioning tensors held fixed while one UNet is active.
#[derive(Debug)]
struct StepConditioning {
    hidden_states: Tensor,
    pooled: Option<Tensor>,
    geometry: Option<Tensor>,
}

impl StepConditioning {
    fn as_noise_conditioning<'a>(
        &'a self,
        time_step: usize,
        residuals: Option<&'a [Residuals]>,
    ) -> NoiseConditioning<'a> {
        NoiseConditioning {
            time_step,
            hidden_states: &self.hidden_states,
            pooled_states: self.pooled.as_ref(),
            geometry: self.geometry.as_ref(),
            residuals,
        }
    }
}

/// Text-to-image and image-to-image generation over a set of networks.
pub struct StableDiffusionPipeline {
    text_encoder: Box<dyn TextEncoder>,
    text_encoder_2: Option<Box<dyn TextEncoder>>,
    unet: Box<dyn NoisePredictor>,
    unet_refiner: Option<Box<dyn NoisePredictor>>,
    encoder: Option<Box<dyn ImageEncoder>>,
    decoder: Box<dyn ImageDecoder>,
    safety_checker: Option<Box<dyn SafetyChecker>>,
    control_nets: Vec<Box<dyn ControlNet>>,
    reduce_memory: bool,
}

impl std::fmt::Debug for StableDiffusionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StableDiffusionPipeline")
            .field("xl", &self.is_xl())
            .field("refiner", &self.unet_refiner.is_some())
            .field("encoder", &self.encoder.is_some())
            .field("safety_checker", &self.safety_checker.is_some())
            .field("control_nets", &self.control_nets.len())
            .field("reduce_memory", &self.reduce_memory)
            .finish()
    }
}

impl StableDiffusionPipeline {
    /// Creates a pipeline from the networks every run needs.
    pub fn new(
        text_encoder: Box<dyn TextEncoder>,
        unet: Box<dyn NoisePredictor>,
        decoder: Box<dyn ImageDecoder>,
    ) -> Self {
        Self {
            text_encoder,
            text_encoder_2: None,
            unet,
            unet_refiner: None,
            encoder: None,
            decoder,
            safety_checker: None,
            control_nets: Vec::new(),
            reduce_memory: false,
        }
    }

    /// Attaches the second (pooled) text encoder, which turns on XL conditioning.
    pub fn with_text_encoder_2(mut self, encoder: Box<dyn TextEncoder>) -> Self {
        self.text_encoder_2 = Some(encoder);
        self
    }

    /// Attaches an XL refiner UNet.
    pub fn with_refiner(mut self, refiner: Box<dyn NoisePredictor>) -> Self {
        self.unet_refiner = Some(refiner);
        self
    }

    /// Attaches the VAE encoder needed for image-to-image.
    pub fn with_encoder(mut self, encoder: Box<dyn ImageEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn with_safety_checker(mut self, checker: Box<dyn SafetyChecker>) -> Self {
        self.safety_checker = Some(checker);
        self
    }

    /// Attaches a ControlNet. Each run needs one conditioning image per network.
    pub fn with_control_net(mut self, control_net: Box<dyn ControlNet>) -> Self {
        self.control_nets.push(control_net);
        self
    }

    /// Unloads the UNet after every run.
    pub fn with_reduce_memory(mut self, reduce_memory: bool) -> Self {
        self.reduce_memory = reduce_memory;
        self
    }

    /// Whether XL conditioning is used.
    pub fn is_xl(&self) -> bool {
        self.text_encoder_2.is_some()
    }

    /// Number of attached ControlNets.
    pub fn control_net_count(&self) -> usize {
        self.control_nets.len()
    }

    /// Generates `config.image_count` images.
    ///
    /// The progress handler runs after every step; returning `false` cancels
    /// the run and an empty vector is returned without decoding. Images
    /// rejected by the safety checker are `None` at their original position.
    pub fn generate_images(
        &mut self,
        config: &PipelineConfiguration,
        mut progress_handler: impl FnMut(&Progress<'_>) -> bool,
    ) -> Result<Vec<Option<RgbImage>>> {
        config.validate()?;
        self.check_dependencies(config)?;

        let guidance = config.uses_guidance();
        let mode = config.mode();
        tracing::info!(
            steps = config.step_count,
            images = config.image_count,
            scheduler = %config.scheduler,
            seed = config.seed,
            guidance_scale = config.guidance_scale,
            ?mode,
            xl = self.is_xl(),
            "starting generation"
        );

        let (base, refiner) = self.encode_prompts(config, guidance)?;
        let latent_shape = single_latent_shape(self.unet.latent_sample_shape())?;

        let mut schedulers: Vec<DynScheduler> = (0..config.image_count)
            .map(|_| create_scheduler(config.scheduler, config.step_count, config.timestep_spacing))
            .collect();
        let init_noise_sigma = schedulers[0].init_noise_sigma();

        let mut random = random_source(config.rng, config.seed);
        let noise = initial_noise(
            random.as_mut(),
            &latent_shape,
            config.image_count,
            init_noise_sigma,
        );

        let (mut latents, strength) = match (&config.starting_image, self.encoder.as_mut()) {
            (Some(starting_image), Some(encoder)) => {
                let height = latent_shape[2] * LATENT_DOWNSCALE;
                let width = latent_shape[3] * LATENT_DOWNSCALE;
                let pixels =
                    image::planar_rgb(starting_image, width as u32, height as u32, -1.0, 1.0);
                let moments = encoder.encode_moments(&pixels)?;
                let latent = sample_latent(&moments, config.encoder_scale_factor, random.as_mut())?;
                (
                    schedulers[0].add_noise(&latent, &noise, config.strength),
                    Some(config.strength),
                )
            }
            _ => (noise, None),
        };

        let conditions = prepare_conditions(&config.control_net_inputs, &latent_shape, guidance)?;
        let time_steps = schedulers[0].calculate_timesteps(strength);
        let step_count = time_steps.len();
        let refiner_start_step = if refiner.is_some() {
            (step_count as f32 * config.xl.refiner_start).round() as usize
        } else {
            usize::MAX
        };

        let mut using_refiner = false;
        let mut denoised = latents.clone();

        for (step, &time_step) in time_steps.iter().enumerate() {
            if step == refiner_start_step {
                tracing::info!(step, "switching to refiner");
                self.unet.unload_resources();
                using_refiner = true;
            }
            let conditioning = match (&refiner, using_refiner) {
                (Some(refiner), true) => refiner,
                _ => &base,
            };

            let latent_inputs = if guidance {
                duplicate_for_guidance(&latents)?
            } else {
                latents.clone()
            };

            let residuals = run_control_nets(
                &mut self.control_nets,
                &conditions,
                &latent_inputs,
                time_step,
                &conditioning.hidden_states,
            )?;

            let noise_conditioning =
                conditioning.as_noise_conditioning(time_step, residuals.as_deref());
            let predictor_kind = if using_refiner {
                ModelKind::UnetRefiner
            } else {
                ModelKind::Unet
            };
            let predictor = self.active_predictor(using_refiner);
            let noise = predict(predictor, &latent_inputs, &noise_conditioning, guidance)?;
            check_noise_shapes(&noise, &latent_inputs, predictor_kind)?;
            let noise = if guidance {
                let guided = perform_guidance(&noise, config.guidance_scale)?;
                check_noise_shapes(&guided, &latents, predictor_kind)?;
                guided
            } else {
                noise
            };

            for (i, scheduler) in schedulers.iter_mut().enumerate() {
                latents[i] = scheduler.step(&noise[i], time_step, &latents[i]);
                denoised[i] = scheduler
                    .model_outputs()
                    .last()
                    .cloned()
                    .unwrap_or_else(|| latents[i].clone());
            }

            tracing::debug!(step, time_step, "denoising step complete");

            let progress = Progress {
                step,
                step_count,
                current_latent_samples: if config.use_denoised_intermediates {
                    &denoised[..]
                } else {
                    &latents[..]
                },
                configuration: config,
            };
            if !progress_handler(&progress) {
                tracing::info!(step, "generation cancelled");
                return Ok(Vec::new());
            }
        }

        if self.reduce_memory {
            self.active_predictor(using_refiner).unload_resources();
        }

        let images = self.decode_to_images(&latents, config)?;
        tracing::info!(
            generated = images.iter().filter(|image| image.is_some()).count(),
            requested = config.image_count,
            "generation finished"
        );
        Ok(images)
    }

    /// Decodes latents into images, applying the safety checker unless
    /// `config.disable_safety` is set.
    pub fn decode_to_images(
        &mut self,
        latents: &[Tensor],
        config: &PipelineConfiguration,
    ) -> Result<Vec<Option<RgbImage>>> {
        let unscaled = unscale_latents(
            latents,
            config.decoder_scale_factor,
            config.decoder_shift_factor,
        );
        let decoded = self.decoder.decode(&unscaled)?;

        let mut images = Vec::with_capacity(decoded.len());
        for (index, tensor) in decoded.iter().enumerate() {
            let image = image::to_rgb_image(tensor)?;
            let safe = match self.safety_checker.as_mut() {
                Some(checker) if !config.disable_safety => checker.is_safe(&image)?,
                _ => true,
            };
            if safe {
                images.push(Some(image));
            } else {
                tracing::info!(index, "image withheld by safety checker");
                images.push(None);
            }
        }
        Ok(images)
    }

    fn check_dependencies(&self, config: &PipelineConfiguration) -> Result<()> {
        if config.mode() == PipelineMode::ImageToImage && self.encoder.is_none() {
            return Err(DiffusionError::missing_dependency(
                ModelKind::VaeEncoder,
                "image-to-image requires a VAE encoder",
            ));
        }

        if !config.control_net_inputs.is_empty() && self.control_nets.is_empty() {
            return Err(DiffusionError::missing_dependency(
                ModelKind::ControlNet,
                "ControlNet inputs given but no ControlNet is attached",
            ));
        }

        if config.control_net_inputs.len() != self.control_nets.len() {
            return Err(DiffusionError::invalid_configuration(format!(
                "{} ControlNets attached but {} conditioning images given",
                self.control_nets.len(),
                config.control_net_inputs.len()
            )));
        }

        Ok(())
    }

    fn active_predictor(&mut self, refiner: bool) -> &mut dyn NoisePredictor {
        match self.unet_refiner.as_mut() {
            Some(unet_refiner) if refiner => unet_refiner.as_mut(),
            _ => self.unet.as_mut(),
        }
    }

    /// Builds the base conditioning and, for XL with a refiner attached, the
    /// refiner conditioning.
    fn encode_prompts(
        &mut self,
        config: &PipelineConfiguration,
        guidance: bool,
    ) -> Result<(StepConditioning, Option<StepConditioning>)> {
        let prompt = self.text_encoder.encode(&config.prompt)?;
        let negative = if guidance {
            Some(self.text_encoder.encode(&config.negative_prompt)?)
        } else {
            None
        };

        let Some(encoder_2) = self.text_encoder_2.as_mut() else {
            let hidden_states = guided(guidance, negative.map(|n| n.hidden_states), prompt.hidden_states)?;
            return Ok((
                StepConditioning {
                    hidden_states,
                    pooled: None,
                    geometry: None,
                },
                None,
            ));
        };

        let prompt_2 = encoder_2.encode(&config.prompt)?;
        let negative_2 = if guidance {
            Some(encoder_2.encode(&config.negative_prompt)?)
        } else {
            None
        };

        let pooled = guided(
            guidance,
            negative_2.as_ref().map(pooled_embedding).transpose()?,
            pooled_embedding(&prompt_2)?,
        )?;

        let base_hidden = guided(
            guidance,
            match (&negative, &negative_2) {
                (Some(n1), Some(n2)) => Some(concat_features(&n1.hidden_states, &n2.hidden_states)?),
                _ => None,
            },
            concat_features(&prompt.hidden_states, &prompt_2.hidden_states)?,
        )?;

        let xl = &config.xl;
        let size_ids = arr2(&[[
            xl.original_size[0],
            xl.original_size[1],
            xl.crop_top_left[0],
            xl.crop_top_left[1],
            xl.target_size[0],
            xl.target_size[1],
        ]])
        .into_dyn();
        let base = StepConditioning {
            hidden_states: base_hidden,
            pooled: Some(pooled.clone()),
            geometry: Some(guided(guidance, Some(size_ids.clone()), size_ids)?),
        };

        if self.unet_refiner.is_none() {
            return Ok((base, None));
        }

        let aesthetic_ids = |score: f32| {
            arr2(&[[
                xl.original_size[0],
                xl.original_size[1],
                xl.crop_top_left[0],
                xl.crop_top_left[1],
                score,
            ]])
            .into_dyn()
        };
        let refiner = StepConditioning {
            hidden_states: guided(
                guidance,
                negative_2.map(|n| n.hidden_states),
                prompt_2.hidden_states,
            )?,
            pooled: Some(pooled),
            geometry: Some(guided(
                guidance,
                Some(aesthetic_ids(xl.negative_aesthetic_score)),
                aesthetic_ids(xl.aesthetic_score),
            )?),
        };

        Ok((base, Some(refiner)))
    }
}

/// Calls the predictor once for the whole batch, or once per guidance half
/// when it only accepts a batch of one.
fn predict(
    predictor: &mut dyn NoisePredictor,
    latents: &[Tensor],
    conditioning: &NoiseConditioning<'_>,
    guidance: bool,
) -> Result<Vec<Tensor>> {
    if !guidance || predictor.batch_size() >= 2 {
        return predictor.predict_noise(latents, conditioning);
    }

    let mut uncond_latents = Vec::with_capacity(latents.len());
    let mut cond_latents = Vec::with_capacity(latents.len());
    for latent in latents {
        let (uncond, cond) = split_batch(latent)?;
        uncond_latents.push(uncond);
        cond_latents.push(cond);
    }

    let hidden = split_batch(conditioning.hidden_states)?;
    let pooled = conditioning.pooled_states.map(split_batch).transpose()?;
    let geometry = conditioning.geometry.map(split_batch).transpose()?;
    let residuals = conditioning.residuals.map(split_residuals).transpose()?;

    let uncond = predictor.predict_noise(
        &uncond_latents,
        &NoiseConditioning {
            time_step: conditioning.time_step,
            hidden_states: &hidden.0,
            pooled_states: pooled.as_ref().map(|(u, _)| u),
            geometry: geometry.as_ref().map(|(u, _)| u),
            residuals: residuals.as_ref().map(|(u, _)| u.as_slice()),
        },
    )?;
    let cond = predictor.predict_noise(
        &cond_latents,
        &NoiseConditioning {
            time_step: conditioning.time_step,
            hidden_states: &hidden.1,
            pooled_states: pooled.as_ref().map(|(_, c)| c),
            geometry: geometry.as_ref().map(|(_, c)| c),
            residuals: residuals.as_ref().map(|(_, c)| c.as_slice()),
        },
    )?;

    uncond
        .iter()
        .zip(&cond)
        .map(|(u, c)| concat_batch(&[u, c]))
        .collect()
}

/// Rejects predictions that do not pair one-to-one with the latents by shape.
fn check_noise_shapes(noise: &[Tensor], latents: &[Tensor], model: ModelKind) -> Result<()> {
    if noise.len() != latents.len() {
        return Err(DiffusionError::invalid_configuration(format!(
            "{} returned {} noise predictions for {} latents",
            model,
            noise.len(),
            latents.len()
        ))
        .for_model(model));
    }
    for (index, (prediction, latent)) in noise.iter().zip(latents).enumerate() {
        if prediction.shape() != latent.shape() {
            return Err(DiffusionError::invalid_configuration(format!(
                "{} prediction {} has shape {:?}, expected {:?}",
                model,
                index,
                prediction.shape(),
                latent.shape()
            ))
            .for_model(model));
        }
    }
    Ok(())
}

fn split_residuals(residuals: &[Residuals]) -> Result<(Vec<Residuals>, Vec<Residuals>)> {
    let mut uncond = Vec::with_capacity(residuals.len());
    let mut cond = Vec::with_capacity(residuals.len());
    for map in residuals {
        let mut u = Residuals::new();
        let mut c = Residuals::new();
        for (name, tensor) in map {
            let (first, second) = split_batch(tensor)?;
            u.insert(name.clone(), first);
            c.insert(name.clone(), second);
        }
        uncond.push(u);
        cond.push(c);
    }
    Ok((uncond, cond))
}

/// Stacks `[uncond, cond]` when guidance is on, otherwise passes `cond`.
fn guided(guidance: bool, uncond: Option<Tensor>, cond: Tensor) -> Result<Tensor> {
    match uncond {
        Some(uncond) if guidance => concat_batch(&[&uncond, &cond]),
        _ => Ok(cond),
    }
}

/// Joins two encoders' hidden states along the feature axis.
fn concat_features(first: &Tensor, second: &Tensor) -> Result<Tensor> {
    let axis = Axis(first.ndim().saturating_sub(1));
    concatenate(axis, &[first.view(), second.view()]).map_err(|e| {
        DiffusionError::invalid_configuration(format!(
            "cannot join hidden states {:?} and {:?}: {}",
            first.shape(),
            second.shape(),
            e
        ))
    })
}

fn pooled_embedding(embedding: &TextEmbedding) -> Result<Tensor> {
    embedding.pooled.clone().ok_or_else(|| {
        DiffusionError::invalid_configuration("second text encoder returned no pooled embedding")
            .for_model(ModelKind::TextEncoder2)
    })
}

/// The predictor's latent shape with a batch of one.
fn single_latent_shape(shape: &[usize]) -> Result<Vec<usize>> {
    if shape.len() != 4 {
        return Err(DiffusionError::invalid_configuration(format!(
            "UNet latent shape must be [batch, channels, h, w], got {:?}",
            shape
        ))
        .for_model(ModelKind::Unet));
    }
    let mut single = shape.to_vec();
    single[0] = 1;
    Ok(single)
}
