//! Multistep diffusion schedulers.
//!
//! A scheduler turns a sequence of noise predictions into a progressively
//! denoised latent. Two solvers are provided:
//!
//! - [`PndmScheduler`]: pseudo linear multistep (Liu et al., ICLR 2022)
//! - [`DpmSolverMultistepScheduler`]: second-order DPM-Solver++ (Lu et al., 2022)
//!
//! Each image in a batch owns its own scheduler instance; instances share no
//! mutable state.

pub mod dpm_solver;
pub mod pndm;
pub mod schedule;

use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::tensor::{weighted_sum, Tensor};

pub use dpm_solver::{DpmSolverMultistepScheduler, SolverOrder};
pub use pndm::PndmScheduler;
pub use schedule::{
    BetaSchedule, NoiseSchedule, ScheduleConfig, TimestepSchedule, TimestepSpacing,
};

/// Scheduler algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Pseudo linear multistep.
    #[default]
    Pndm,
    /// DPM-Solver++ second-order multistep.
    DpmSolverMultistep,
}

impl SchedulerKind {
    /// Parses a scheduler kind from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "pndm" => Some(SchedulerKind::Pndm),
            "dpm" | "dpm-solver" | "dpm-solver++" | "dpmpp" | "dpm-solver-multistep" => {
                Some(SchedulerKind::DpmSolverMultistep)
            }
            _ => None,
        }
    }

    /// Returns the string name of this scheduler.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::Pndm => "pndm",
            SchedulerKind::DpmSolverMultistep => "dpm-solver",
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Common interface of the multistep solvers.
pub trait Scheduler {
    /// Number of training diffusion steps.
    fn train_step_count(&self) -> usize;

    /// Number of inference steps this scheduler was configured with.
    fn inference_step_count(&self) -> usize;

    /// Descending training timesteps visited during inference.
    fn time_steps(&self) -> &[usize];

    fn betas(&self) -> &[f32];

    fn alphas(&self) -> &[f32];

    fn alphas_cum_prod(&self) -> &[f32];

    /// Standard deviation of the initial noise.
    fn init_noise_sigma(&self) -> f32 {
        1.0
    }

    /// Denoised-sample estimates produced by previous steps, oldest first.
    fn model_outputs(&self) -> &[Tensor];

    /// Advances `sample` by one step given the model's noise prediction.
    fn step(&mut self, output: &Tensor, time_step: usize, sample: &Tensor) -> Tensor;

    /// Timesteps to visit, truncated to the trajectory suffix for `strength`.
    fn calculate_timesteps(&self, strength: Option<f32>) -> Vec<usize> {
        let time_steps = self.time_steps();
        match strength {
            None => time_steps.to_vec(),
            Some(strength) => {
                let start = start_step(self.inference_step_count(), strength);
                time_steps.get(start..).map(<[usize]>::to_vec).unwrap_or_default()
            }
        }
    }

    /// Places `original` on the trajectory at the first timestep `strength`
    /// keeps, once per noise sample.
    fn add_noise(&self, original: &Tensor, noises: &[Tensor], strength: f32) -> Vec<Tensor> {
        let time_steps = self.time_steps();
        let start = start_step(self.inference_step_count(), strength)
            .min(time_steps.len().saturating_sub(1));
        let alpha_prod = self.alphas_cum_prod()[time_steps[start]] as f64;
        let sqrt_alpha_prod = alpha_prod.sqrt();
        let sqrt_beta_prod = (1.0 - alpha_prod).sqrt();

        noises
            .iter()
            .map(|noise| weighted_sum(&[sqrt_alpha_prod, sqrt_beta_prod], &[original, noise]))
            .collect()
    }
}

/// First step index kept when truncating the schedule for `strength`.
pub fn start_step(inference_step_count: usize, strength: f32) -> usize {
    let kept = (inference_step_count as f32 * strength).round() as usize;
    inference_step_count.saturating_sub(kept)
}

/// Reparameterizes a noise residual into a predicted clean sample:
/// `(sample - output * sigma) / alpha`.
pub(crate) fn predicted_original_sample(
    output: &Tensor,
    sample: &Tensor,
    alpha: f32,
    sigma: f32,
) -> Tensor {
    Zip::from(sample)
        .and(output)
        .map_collect(|&s, &m| (s - m * sigma) / alpha)
}

/// Scheduler wrapper for dynamic dispatch over the available solvers.
#[derive(Debug, Clone)]
pub enum DynScheduler {
    Pndm(PndmScheduler),
    DpmSolver(DpmSolverMultistepScheduler),
}

impl DynScheduler {
    /// Returns the kind of the wrapped scheduler.
    pub fn kind(&self) -> SchedulerKind {
        match self {
            DynScheduler::Pndm(_) => SchedulerKind::Pndm,
            DynScheduler::DpmSolver(_) => SchedulerKind::DpmSolverMultistep,
        }
    }

    fn inner(&self) -> &dyn Scheduler {
        match self {
            DynScheduler::Pndm(s) => s,
            DynScheduler::DpmSolver(s) => s,
        }
    }
}

impl Scheduler for DynScheduler {
    fn train_step_count(&self) -> usize {
        self.inner().train_step_count()
    }

    fn inference_step_count(&self) -> usize {
        self.inner().inference_step_count()
    }

    fn time_steps(&self) -> &[usize] {
        self.inner().time_steps()
    }

    fn betas(&self) -> &[f32] {
        self.inner().betas()
    }

    fn alphas(&self) -> &[f32] {
        self.inner().alphas()
    }

    fn alphas_cum_prod(&self) -> &[f32] {
        self.inner().alphas_cum_prod()
    }

    fn init_noise_sigma(&self) -> f32 {
        self.inner().init_noise_sigma()
    }

    fn model_outputs(&self) -> &[Tensor] {
        self.inner().model_outputs()
    }

    fn step(&mut self, output: &Tensor, time_step: usize, sample: &Tensor) -> Tensor {
        match self {
            DynScheduler::Pndm(s) => s.step(output, time_step, sample),
            DynScheduler::DpmSolver(s) => s.step(output, time_step, sample),
        }
    }
}

/// Creates a scheduler of the specified kind with the Stable Diffusion
/// training schedule.
///
/// # Arguments
/// * `kind` - The solver to create
/// * `step_count` - Number of inference steps
/// * `spacing` - Timestep spacing policy
pub fn create_scheduler(
    kind: SchedulerKind,
    step_count: usize,
    spacing: TimestepSpacing,
) -> DynScheduler {
    let config = ScheduleConfig::default();
    match kind {
        SchedulerKind::Pndm => DynScheduler::Pndm(PndmScheduler::new(step_count, spacing, &config)),
        SchedulerKind::DpmSolverMultistep => {
            DynScheduler::DpmSolver(DpmSolverMultistepScheduler::new(step_count, spacing, &config))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::filled;

    #[test]
    fn scheduler_kind_parsing() {
        assert_eq!(SchedulerKind::parse("pndm"), Some(SchedulerKind::Pndm));
        assert_eq!(SchedulerKind::parse("DPM-Solver"), Some(SchedulerKind::DpmSolverMultistep));
        assert_eq!(SchedulerKind::parse("dpm_solver"), Some(SchedulerKind::DpmSolverMultistep));
        assert_eq!(SchedulerKind::parse("euler"), None);
        assert_eq!(SchedulerKind::DpmSolverMultistep.as_str(), "dpm-solver");
    }

    #[test]
    fn create_scheduler_variants() {
        let pndm = create_scheduler(SchedulerKind::Pndm, 20, TimestepSpacing::Linspace);
        assert!(matches!(pndm, DynScheduler::Pndm(_)));
        assert_eq!(pndm.kind(), SchedulerKind::Pndm);
        assert_eq!(pndm.inference_step_count(), 20);

        let dpm = create_scheduler(SchedulerKind::DpmSolverMultistep, 20, TimestepSpacing::Karras);
        assert!(matches!(dpm, DynScheduler::DpmSolver(_)));
        assert_eq!(dpm.time_steps().len(), 20);
        assert_eq!(dpm.init_noise_sigma(), 1.0);
    }

    #[test]
    fn start_step_rounds_kept_steps() {
        assert_eq!(start_step(50, 1.0), 0);
        assert_eq!(start_step(50, 0.75), 12); // round(37.5) = 38 kept
        assert_eq!(start_step(10, 0.04), 10);
    }

    #[test]
    fn calculate_timesteps_full_schedule() {
        let scheduler = create_scheduler(SchedulerKind::Pndm, 50, TimestepSpacing::Linspace);
        assert_eq!(scheduler.calculate_timesteps(None), scheduler.time_steps());
        assert_eq!(scheduler.calculate_timesteps(Some(1.0)), scheduler.time_steps());
    }

    #[test]
    fn calculate_timesteps_strength_is_suffix() {
        let scheduler = create_scheduler(SchedulerKind::DpmSolverMultistep, 50, TimestepSpacing::Linspace);
        for strength in [0.1_f32, 0.3, 0.5, 0.75, 0.9] {
            let steps = scheduler.calculate_timesteps(Some(strength));
            let expected_len = (50.0 * strength).round() as usize;
            assert_eq!(steps.len(), expected_len, "strength {}", strength);
            assert!(steps.len() < 50);
            assert!(scheduler.time_steps().ends_with(&steps));
        }
    }

    #[test]
    fn add_noise_mixes_signal_and_noise() {
        let scheduler = create_scheduler(SchedulerKind::Pndm, 10, TimestepSpacing::Linspace);
        let original = filled(&[1, 4, 2, 2], 2.0);
        let zero = filled(&[1, 4, 2, 2], 0.0);
        let ones = filled(&[1, 4, 2, 2], 1.0);

        let strength = 0.5;
        let t = scheduler.time_steps()[start_step(10, strength)];
        let alpha_prod = scheduler.alphas_cum_prod()[t] as f64;

        let noised = scheduler.add_noise(&original, &[zero, ones], strength);
        assert_eq!(noised.len(), 2);

        let signal_only = (2.0 * alpha_prod.sqrt()) as f32;
        assert!(noised[0].iter().all(|v| (v - signal_only).abs() < 1e-6));

        let mixed = (2.0 * alpha_prod.sqrt() + (1.0 - alpha_prod).sqrt()) as f32;
        assert!(noised[1].iter().all(|v| (v - mixed).abs() < 1e-6));
    }

    #[test]
    fn add_noise_at_full_strength_scales_by_first_alpha() {
        for kind in [SchedulerKind::Pndm, SchedulerKind::DpmSolverMultistep] {
            let scheduler = create_scheduler(kind, 10, TimestepSpacing::Linspace);
            let original = filled(&[1, 4, 2, 2], 0.37);
            let zero = filled(&[1, 4, 2, 2], 0.0);

            let t = scheduler.time_steps()[0];
            let alpha_prod = scheduler.alphas_cum_prod()[t];
            assert!(alpha_prod < 0.01, "{}: first step is nearly pure noise", kind);

            let noised = scheduler.add_noise(&original, &[zero], 1.0);
            let expected = 0.37 * alpha_prod.sqrt();
            assert!(noised[0].iter().all(|v| (v - expected).abs() < 1e-6), "{}", kind);
        }
    }

    // Exact reproduction only holds where the cumulative alpha is 1.
    #[test]
    fn add_noise_with_noiseless_schedule_reproduces_original() {
        let config = ScheduleConfig {
            beta_schedule: BetaSchedule::Linear,
            beta_start: 0.0,
            beta_end: 0.0,
            ..ScheduleConfig::default()
        };
        let scheduler = PndmScheduler::new(10, TimestepSpacing::Linspace, &config);
        let original = filled(&[1, 4, 2, 2], 0.37);
        let zero = filled(&[1, 4, 2, 2], 0.0);

        let noised = scheduler.add_noise(&original, &[zero], 1.0);
        for (a, b) in noised[0].iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-7);
        }
    }
}
