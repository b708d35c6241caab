//! DPM-Solver++ multistep scheduler.
//!
//! Second-order midpoint solver over epsilon predictions, without dynamic
//! thresholding (Lu et al., "DPM-Solver++: Fast Solver for Guided Sampling of
//! Diffusion Probabilistic Models", 2022). See <https://arxiv.org/abs/2211.01095>
//! for the derivation of the update rules.

use crate::tensor::{weighted_sum, Tensor};

use super::schedule::{NoiseSchedule, ScheduleConfig, TimestepSchedule, TimestepSpacing};
use super::{predicted_original_sample, Scheduler};

/// Order of the multistep solver.
const SOLVER_ORDER: usize = 2;

/// Schedules shorter than this finish with first-order updates.
const LOWER_ORDER_FINAL_THRESHOLD: usize = 15;

/// Update rule applied by a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverOrder {
    /// DDIM-equivalent single-step update.
    First,
    /// Midpoint multistep update using the two most recent outputs.
    Second,
}

/// Second-order DPM-Solver++ scheduler.
#[derive(Debug, Clone)]
pub struct DpmSolverMultistepScheduler {
    schedule: NoiseSchedule,
    inference_step_count: usize,
    timesteps: TimestepSchedule,
    /// Steps taken so far, saturating at the solver order.
    lower_order_stepped: usize,
    use_lower_order_final: bool,
    /// Most recent converted outputs, oldest first.
    model_outputs: Vec<Tensor>,
    last_step_index: Option<usize>,
    last_order: Option<SolverOrder>,
}

impl DpmSolverMultistepScheduler {
    /// Creates a new DPM-Solver++ scheduler.
    ///
    /// # Arguments
    ///
    /// * `step_count` - Number of inference steps
    /// * `spacing` - Timestep spacing policy
    /// * `config` - Training noise schedule parameters
    pub fn new(step_count: usize, spacing: TimestepSpacing, config: &ScheduleConfig) -> Self {
        let schedule = NoiseSchedule::new(config);
        let timesteps = spacing.build(&schedule, step_count);

        Self {
            schedule,
            inference_step_count: step_count,
            timesteps,
            lower_order_stepped: 0,
            use_lower_order_final: true,
            model_outputs: Vec::with_capacity(SOLVER_ORDER),
            last_step_index: None,
            last_order: None,
        }
    }

    /// Creates a scheduler with the Stable Diffusion training schedule.
    pub fn stable_diffusion(step_count: usize, spacing: TimestepSpacing) -> Self {
        Self::new(step_count, spacing, &ScheduleConfig::default())
    }

    /// Update order used by the most recent step, if any.
    pub fn last_order(&self) -> Option<SolverOrder> {
        self.last_order
    }

    /// Number of steps taken, saturating at the solver order.
    pub fn lower_order_stepped(&self) -> usize {
        self.lower_order_stepped
    }

    /// Whether coefficients are indexed by schedule position (Karras spacing).
    pub fn using_karras_sigmas(&self) -> bool {
        self.timesteps.using_karras_sigmas
    }

    /// Position of `time_step` in the schedule.
    ///
    /// Karras schedules may repeat a timestep, so the search starts after the
    /// previously located step. Unknown timesteps map to the final step.
    fn locate_step_index(&self, time_step: usize) -> usize {
        let time_steps = &self.timesteps.time_steps;
        let from = self.last_step_index.map_or(0, |i| i + 1);

        time_steps
            .get(from..)
            .and_then(|rest| rest.iter().position(|&t| t == time_step))
            .map(|i| i + from)
            .or_else(|| time_steps.iter().position(|&t| t == time_step))
            .unwrap_or_else(|| time_steps.len().saturating_sub(1))
    }

    /// Index into the coefficient tables for the schedule entry at
    /// `position`, whose training timestep is `time_step`.
    fn coefficient_index(&self, position: usize, time_step: usize) -> usize {
        if self.timesteps.using_karras_sigmas {
            position
        } else {
            time_step.min(self.schedule.train_step_count - 1)
        }
    }

    /// Converts a noise prediction at the schedule entry `index` into a
    /// predicted clean sample.
    fn convert_model_output(&self, output: &Tensor, index: usize, sample: &Tensor) -> Tensor {
        predicted_original_sample(
            output,
            sample,
            self.timesteps.alpha_t[index],
            self.timesteps.sigma_t[index],
        )
    }

    /// One-step update, equivalent to DDIM.
    fn first_order_update(
        &self,
        model_output: &Tensor,
        curr_index: usize,
        prev_index: usize,
        sample: &Tensor,
    ) -> Tensor {
        let ts = &self.timesteps;
        let p_lambda_t = ts.lambda_t[prev_index] as f64;
        let lambda_s = ts.lambda_t[curr_index] as f64;
        let p_alpha_t = ts.alpha_t[prev_index] as f64;
        let p_sigma_t = ts.sigma_t[prev_index] as f64;
        let sigma_s = ts.sigma_t[curr_index] as f64;

        let h = p_lambda_t - lambda_s;
        // x_t = (sigma_t / sigma_s) * sample - (alpha_t * (exp(-h) - 1)) * model_output
        weighted_sum(
            &[p_sigma_t / sigma_s, -p_alpha_t * ((-h).exp() - 1.0)],
            &[sample, model_output],
        )
    }

    /// Midpoint update from the two most recent converted outputs.
    fn second_order_update(
        &self,
        s0_index: usize,
        s1_index: usize,
        prev_index: usize,
        sample: &Tensor,
    ) -> Tensor {
        let ts = &self.timesteps;
        let n = self.model_outputs.len();
        let m0 = &self.model_outputs[n - 1];
        let m1 = &self.model_outputs[n - 2];

        let p_lambda_t = ts.lambda_t[prev_index] as f64;
        let lambda_s0 = ts.lambda_t[s0_index] as f64;
        let lambda_s1 = ts.lambda_t[s1_index] as f64;
        let p_alpha_t = ts.alpha_t[prev_index] as f64;
        let p_sigma_t = ts.sigma_t[prev_index] as f64;
        let sigma_s0 = ts.sigma_t[s0_index] as f64;

        let h = p_lambda_t - lambda_s0;
        let h_0 = lambda_s0 - lambda_s1;
        let r0 = h_0 / h;

        let d0 = m0;
        let d1 = weighted_sum(&[1.0 / r0, -1.0 / r0], &[m0, m1]);

        let alpha_term = p_alpha_t * ((-h).exp() - 1.0);
        weighted_sum(
            &[p_sigma_t / sigma_s0, -alpha_term, -0.5 * alpha_term],
            &[sample, d0, &d1],
        )
    }
}

impl Scheduler for DpmSolverMultistepScheduler {
    fn train_step_count(&self) -> usize {
        self.schedule.train_step_count
    }

    fn inference_step_count(&self) -> usize {
        self.inference_step_count
    }

    fn time_steps(&self) -> &[usize] {
        &self.timesteps.time_steps
    }

    fn betas(&self) -> &[f32] {
        &self.schedule.betas
    }

    fn alphas(&self) -> &[f32] {
        &self.schedule.alphas
    }

    fn alphas_cum_prod(&self) -> &[f32] {
        &self.schedule.alphas_cum_prod
    }

    fn model_outputs(&self) -> &[Tensor] {
        &self.model_outputs
    }

    fn step(&mut self, output: &Tensor, time_step: usize, sample: &Tensor) -> Tensor {
        let count = self.timesteps.time_steps.len();
        let step_index = self.locate_step_index(time_step);
        let is_last = step_index + 1 >= count;
        let prev_timestep = if is_last {
            0
        } else {
            self.timesteps.time_steps[step_index + 1]
        };

        let short_schedule = self.use_lower_order_final && count < LOWER_ORDER_FINAL_THRESHOLD;
        let lower_order_final = short_schedule && is_last;
        let lower_order_second = short_schedule && step_index + 2 == count;
        let lower_order = self.lower_order_stepped < 1 || lower_order_final || lower_order_second;

        let curr_index = self.coefficient_index(step_index, time_step);
        let prev_index = self.coefficient_index(step_index + 1, prev_timestep);

        let model_output = self.convert_model_output(output, curr_index, sample);
        if self.model_outputs.len() == SOLVER_ORDER {
            self.model_outputs.remove(0);
        }
        self.model_outputs.push(model_output);

        let (prev_sample, order) = if lower_order || self.model_outputs.len() < SOLVER_ORDER {
            let latest = &self.model_outputs[self.model_outputs.len() - 1];
            (
                self.first_order_update(latest, curr_index, prev_index, sample),
                SolverOrder::First,
            )
        } else {
            let s1_timestep = self.timesteps.time_steps[step_index - 1];
            let s1_index = self.coefficient_index(step_index - 1, s1_timestep);
            (
                self.second_order_update(curr_index, s1_index, prev_index, sample),
                SolverOrder::Second,
            )
        };

        tracing::debug!(
            step_index,
            time_step,
            prev_timestep,
            order = ?order,
            "dpm-solver++ step"
        );

        if self.lower_order_stepped < SOLVER_ORDER {
            self.lower_order_stepped += 1;
        }
        self.last_step_index = Some(step_index);
        self.last_order = Some(order);
        prev_sample
    }
}
