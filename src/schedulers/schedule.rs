//! Noise schedule math shared by all schedulers.
//!
//! Computes the training beta/alpha schedule and the inference timestep
//! schedule for each spacing policy, together with the per-timestep
//! `alpha_t`, `sigma_t` and `lambda_t` coefficients the solvers index into.

use serde::{Deserialize, Serialize};

/// Number of training timesteps used by Stable Diffusion checkpoints.
pub const DEFAULT_TRAIN_STEP_COUNT: usize = 1000;

/// Beta at the first training timestep for Stable Diffusion.
pub const DEFAULT_BETA_START: f32 = 0.00085;

/// Beta at the last training timestep for Stable Diffusion.
pub const DEFAULT_BETA_END: f32 = 0.012;

/// Exponent used to space Karras sigmas.
const KARRAS_RHO: f32 = 7.0;

/// How betas range from `beta_start` to `beta_end` during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    #[default]
    ScaledLinear,
}

/// Policy for picking inference timesteps out of the training schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimestepSpacing {
    /// Evenly spaced over the whole training range.
    #[default]
    Linspace,
    /// Integer multiples of a step ratio, offset by one.
    Leading,
    /// Karras et al. sigma spacing, denser at low noise levels.
    Karras,
}

impl TimestepSpacing {
    /// Parses a spacing policy from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "linspace" => Some(TimestepSpacing::Linspace),
            "leading" => Some(TimestepSpacing::Leading),
            "karras" => Some(TimestepSpacing::Karras),
            _ => None,
        }
    }

    /// Returns the string name of this spacing policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestepSpacing::Linspace => "linspace",
            TimestepSpacing::Leading => "leading",
            TimestepSpacing::Karras => "karras",
        }
    }

    /// Builds the inference timestep schedule for this policy.
    pub fn build(&self, schedule: &NoiseSchedule, step_count: usize) -> TimestepSchedule {
        match self {
            TimestepSpacing::Linspace => {
                let last = (schedule.train_step_count - 1) as f32;
                let time_steps = linspace(0.0, last, step_count + 1)
                    .into_iter()
                    .skip(1)
                    .rev()
                    .map(|t| t.round() as usize)
                    .collect();
                TimestepSchedule::uniform(schedule, time_steps)
            }
            TimestepSpacing::Leading => {
                let step_ratio = (schedule.train_step_count - 1) / (step_count + 1);
                let time_steps = (1..=step_count)
                    .rev()
                    .map(|i| 1 + i * step_ratio)
                    .collect();
                TimestepSchedule::uniform(schedule, time_steps)
            }
            TimestepSpacing::Karras => TimestepSchedule::karras(schedule, step_count),
        }
    }
}

impl std::fmt::Display for TimestepSpacing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters of the training noise schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Number of diffusion steps the model was trained with.
    pub train_step_count: usize,
    /// Interpolation used for betas.
    pub beta_schedule: BetaSchedule,
    /// First beta value.
    pub beta_start: f32,
    /// Last beta value.
    pub beta_end: f32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            train_step_count: DEFAULT_TRAIN_STEP_COUNT,
            beta_schedule: BetaSchedule::ScaledLinear,
            beta_start: DEFAULT_BETA_START,
            beta_end: DEFAULT_BETA_END,
        }
    }
}

/// Training-time noise schedule: betas, alphas and their running product.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    pub train_step_count: usize,
    pub betas: Vec<f32>,
    pub alphas: Vec<f32>,
    pub alphas_cum_prod: Vec<f32>,
}

impl NoiseSchedule {
    /// Computes the schedule from its configuration.
    pub fn new(config: &ScheduleConfig) -> Self {
        let betas = configure_betas(
            config.beta_schedule,
            config.beta_start,
            config.beta_end,
            config.train_step_count,
        );
        let alphas: Vec<f32> = betas.iter().map(|b| 1.0 - b).collect();
        let alphas_cum_prod = compute_alphas_cum_prod(&alphas);

        Self {
            train_step_count: config.train_step_count,
            betas,
            alphas,
            alphas_cum_prod,
        }
    }

    /// Per-training-step noise magnitude `sqrt((1 - ᾱ) / ᾱ)`.
    pub fn sigmas(&self) -> Vec<f32> {
        self.alphas_cum_prod
            .iter()
            .map(|a| ((1.0 - a) / a).sqrt())
            .collect()
    }
}

impl Default for NoiseSchedule {
    fn default() -> Self {
        Self::new(&ScheduleConfig::default())
    }
}

/// Inference timesteps with the coefficient tables the solvers read.
///
/// Without Karras spacing the coefficient tables are indexed by training
/// timestep. With Karras spacing they are indexed by position in
/// `time_steps` and carry one extra sentinel entry at the end.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestepSchedule {
    /// Descending training-timestep indices visited during inference.
    pub time_steps: Vec<usize>,
    pub alpha_t: Vec<f32>,
    pub sigma_t: Vec<f32>,
    pub lambda_t: Vec<f32>,
    pub using_karras_sigmas: bool,
}

impl TimestepSchedule {
    fn uniform(schedule: &NoiseSchedule, time_steps: Vec<usize>) -> Self {
        let alpha_t: Vec<f32> = schedule.alphas_cum_prod.iter().map(|a| a.sqrt()).collect();
        let sigma_t: Vec<f32> = schedule
            .alphas_cum_prod
            .iter()
            .map(|a| (1.0 - a).sqrt())
            .collect();
        let lambda_t = log_snr(&alpha_t, &sigma_t);

        Self {
            time_steps,
            alpha_t,
            sigma_t,
            lambda_t,
            using_karras_sigmas: false,
        }
    }

    fn karras(schedule: &NoiseSchedule, step_count: usize) -> Self {
        let sigmas = schedule.sigmas();
        let log_sigmas: Vec<f32> = sigmas.iter().map(|s| s.ln()).collect();

        // Sigmas grow with the training timestep.
        let sigma_min = sigmas[0];
        let sigma_max = sigmas[sigmas.len() - 1];

        let mut karras_sigmas = karras_sigmas(sigma_min, sigma_max, step_count);
        let time_steps = karras_sigmas
            .iter()
            .map(|&sigma| sigma_to_timestep(sigma, &log_sigmas))
            .collect();

        if let Some(&last) = karras_sigmas.last() {
            karras_sigmas.push(last);
        }

        let alpha_t: Vec<f32> = karras_sigmas
            .iter()
            .map(|s| 1.0 / (1.0 + s * s).sqrt())
            .collect();
        let sigma_t: Vec<f32> = karras_sigmas
            .iter()
            .zip(&alpha_t)
            .map(|(s, a)| s * a)
            .collect();
        let lambda_t = log_snr(&alpha_t, &sigma_t);

        Self {
            time_steps,
            alpha_t,
            sigma_t,
            lambda_t,
            using_karras_sigmas: true,
        }
    }
}

/// Computes `betas[0..count)` for the given schedule.
pub fn configure_betas(schedule: BetaSchedule, start: f32, end: f32, count: usize) -> Vec<f32> {
    match schedule {
        BetaSchedule::Linear => linspace(start, end, count),
        BetaSchedule::ScaledLinear => linspace(start.sqrt(), end.sqrt(), count)
            .into_iter()
            .map(|b| b * b)
            .collect(),
    }
}

/// Running product of the alphas.
pub fn compute_alphas_cum_prod(alphas: &[f32]) -> Vec<f32> {
    alphas
        .iter()
        .scan(1.0_f32, |acc, &a| {
            *acc *= a;
            Some(*acc)
        })
        .collect()
}

/// `count` evenly spaced values from `start` to `end` inclusive.
pub fn linspace(start: f32, end: f32, count: usize) -> Vec<f32> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let scale = (end - start) / (count - 1) as f32;
            (0..count).map(|i| i as f32 * scale + start).collect()
        }
    }
}

/// Karras et al. (2022) noise levels from `sigma_max` down to `sigma_min`.
pub fn karras_sigmas(sigma_min: f32, sigma_max: f32, step_count: usize) -> Vec<f32> {
    let min_inv_rho = sigma_min.powf(1.0 / KARRAS_RHO);
    let max_inv_rho = sigma_max.powf(1.0 / KARRAS_RHO);
    linspace(0.0, 1.0, step_count)
        .into_iter()
        .map(|ramp| (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(KARRAS_RHO))
        .collect()
}

/// Maps a noise level back onto the (ascending) training log-sigma table.
///
/// Interpolates between the two bracketing training timesteps and rounds to
/// the nearest integer timestep.
pub fn sigma_to_timestep(sigma: f32, log_sigmas: &[f32]) -> usize {
    debug_assert!(log_sigmas.len() >= 2, "need at least two training sigmas");
    let log_sigma = sigma.ln();

    // Last index whose distance is non-negative, clipped to len - 2.
    let low_index = log_sigmas
        .iter()
        .rposition(|&ls| log_sigma - ls >= 0.0)
        .unwrap_or(0)
        .min(log_sigmas.len() - 2);
    let high_index = low_index + 1;

    let low = log_sigmas[low_index];
    let high = log_sigmas[high_index];
    let w = ((low - log_sigma) / (low - high)).clamp(0.0, 1.0);

    let t = (1.0 - w) * low_index as f32 + w * high_index as f32;
    t.round() as usize
}

fn log_snr(alpha_t: &[f32], sigma_t: &[f32]) -> Vec<f32> {
    alpha_t
        .iter()
        .zip(sigma_t)
        .map(|(a, s)| a.ln() - s.ln())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spacing_parsing() {
        assert_eq!(TimestepSpacing::parse("linspace"), Some(TimestepSpacing::Linspace));
        assert_eq!(TimestepSpacing::parse("Leading"), Some(TimestepSpacing::Leading));
        assert_eq!(TimestepSpacing::parse("KARRAS"), Some(TimestepSpacing::Karras));
        assert_eq!(TimestepSpacing::parse("trailing"), None);
        assert_eq!(TimestepSpacing::Karras.as_str(), "karras");
    }

    #[test]
    fn linear_betas_are_evenly_spaced() {
        let betas = configure_betas(BetaSchedule::Linear, 0.1, 0.5, 5);
        let expected = [0.1, 0.2, 0.3, 0.4, 0.5];
        for (b, e) in betas.iter().zip(expected) {
            assert!((b - e).abs() < 1e-6, "{} != {}", b, e);
        }
    }

    #[test]
    fn scaled_linear_betas_square_the_interpolated_roots() {
        let betas = configure_betas(BetaSchedule::ScaledLinear, 0.01, 0.09, 3);
        // roots: 0.1, 0.2, 0.3
        assert!((betas[0] - 0.01).abs() < 1e-6);
        assert!((betas[1] - 0.04).abs() < 1e-6);
        assert!((betas[2] - 0.09).abs() < 1e-6);
    }

    #[test]
    fn alphas_cum_prod_invariants() {
        for beta_schedule in [BetaSchedule::Linear, BetaSchedule::ScaledLinear] {
            for count in [2, 10, 1000] {
                let schedule = NoiseSchedule::new(&ScheduleConfig {
                    train_step_count: count,
                    beta_schedule,
                    ..ScheduleConfig::default()
                });
                for i in 0..count {
                    assert_eq!(schedule.alphas[i], 1.0 - schedule.betas[i]);
                    let a = schedule.alphas_cum_prod[i];
                    assert!(a > 0.0 && a <= 1.0, "alphas_cum_prod[{}] = {}", i, a);
                    if i > 0 {
                        assert!(a <= schedule.alphas_cum_prod[i - 1]);
                    }
                }
            }
        }
    }

    #[test]
    fn linspace_timesteps_descend_from_last_train_step() {
        let schedule = NoiseSchedule::default();
        let steps = TimestepSpacing::Linspace.build(&schedule, 50);
        assert_eq!(steps.time_steps.len(), 50);
        assert_eq!(steps.time_steps[0], 999);
        assert_eq!(steps.time_steps[49], 20);
        assert!(steps.time_steps.windows(2).all(|w| w[0] > w[1]));
        assert!(!steps.using_karras_sigmas);
        assert_eq!(steps.alpha_t.len(), 1000);
    }

    #[test]
    fn leading_timesteps_use_integer_ratio() {
        let schedule = NoiseSchedule::default();
        let steps = TimestepSpacing::Leading.build(&schedule, 50);
        // (1000 - 1) / 51 = 19
        assert_eq!(steps.time_steps.len(), 50);
        assert_eq!(steps.time_steps[0], 1 + 50 * 19);
        assert_eq!(steps.time_steps[49], 20);
        assert!(steps.time_steps.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn uniform_coefficients_match_alphas_cum_prod() {
        let schedule = NoiseSchedule::default();
        let steps = TimestepSpacing::Linspace.build(&schedule, 10);
        for t in [0, 500, 999] {
            let a = schedule.alphas_cum_prod[t];
            assert!((steps.alpha_t[t] - a.sqrt()).abs() < 1e-6);
            assert!((steps.sigma_t[t] - (1.0 - a).sqrt()).abs() < 1e-6);
            let lambda = steps.alpha_t[t].ln() - steps.sigma_t[t].ln();
            assert!((steps.lambda_t[t] - lambda).abs() < 1e-6);
        }
    }

    #[test]
    fn karras_schedule_shape() {
        let schedule = NoiseSchedule::default();
        for step_count in [4, 15, 25] {
            let steps = TimestepSpacing::Karras.build(&schedule, step_count);
            assert_eq!(steps.time_steps.len(), step_count);
            assert!(steps.using_karras_sigmas);
            // One extra sentinel entry duplicating the last sigma.
            assert_eq!(steps.sigma_t.len(), step_count + 1);
            assert_eq!(steps.sigma_t[step_count], steps.sigma_t[step_count - 1]);
            assert_eq!(steps.time_steps[0], 999);
            assert!(steps.time_steps.windows(2).all(|w| w[0] >= w[1]));
        }
    }

    #[test]
    fn karras_coefficients_are_consistent() {
        let schedule = NoiseSchedule::default();
        let steps = TimestepSpacing::Karras.build(&schedule, 10);
        for (a, s) in steps.alpha_t.iter().zip(&steps.sigma_t) {
            // alpha^2 + sigma^2 == 1 by construction
            assert!((a * a + s * s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn sigma_to_timestep_inverts_training_sigmas() {
        let schedule = NoiseSchedule::default();
        let sigmas = schedule.sigmas();
        let log_sigmas: Vec<f32> = sigmas.iter().map(|s| s.ln()).collect();
        for (t, &sigma) in sigmas.iter().enumerate() {
            let recovered = sigma_to_timestep(sigma, &log_sigmas);
            assert!(
                (recovered as i64 - t as i64).abs() <= 1,
                "sigma_to_timestep({}) = {} for t = {}",
                sigma,
                recovered,
                t
            );
        }
    }

    #[test]
    fn sigma_to_timestep_clamps_out_of_range() {
        let log_sigmas = vec![0.0_f32, 1.0, 2.0];
        // Below the table maps to the first index.
        assert_eq!(sigma_to_timestep(0.5_f32, &log_sigmas), 0);
        // Above the table maps to the last index.
        assert_eq!(sigma_to_timestep(100.0_f32, &log_sigmas), 2);
        // Halfway between index 0 and 1 in log space rounds up.
        assert_eq!(sigma_to_timestep(0.6_f32.exp(), &log_sigmas), 1);
    }

    #[test]
    fn linspace_edge_counts() {
        assert!(linspace(0.0, 1.0, 0).is_empty());
        assert_eq!(linspace(3.0, 9.0, 1), vec![3.0]);
    }
}
