//! Pseudo numerical methods for diffusion models (PNDM).
//!
//! Only the pseudo linear multistep (PLMS) part of the method is implemented;
//! there is no Runge-Kutta warm-up. The first two calls form the warm-up: the
//! second call re-evaluates the first transition using the average of both
//! noise predictions, starting again from the sample cached on the first call.

use crate::tensor::{weighted_sum, Tensor};

use super::schedule::{NoiseSchedule, ScheduleConfig, TimestepSchedule, TimestepSpacing};
use super::{predicted_original_sample, Scheduler};

/// Maximum number of noise residuals kept for extrapolation.
const ETS_CAPACITY: usize = 4;

/// PLMS scheduler (Liu et al., "Pseudo Numerical Methods for Diffusion
/// Models on Manifolds", ICLR 2022).
#[derive(Debug, Clone)]
pub struct PndmScheduler {
    /// Training noise schedule.
    schedule: NoiseSchedule,
    /// Number of inference steps.
    inference_step_count: usize,
    /// Timestep schedule and `alpha_t`/`sigma_t` tables (train-timestep indexed).
    timesteps: TimestepSchedule,
    /// Number of completed `step` calls.
    counter: usize,
    /// Most recent noise residuals, oldest first.
    ets: Vec<Tensor>,
    /// Sample cached on the first call and restored on the second.
    current_sample: Option<Tensor>,
    /// Predicted clean samples, one per step.
    model_outputs: Vec<Tensor>,
}

impl PndmScheduler {
    /// Creates a new PNDM scheduler.
    ///
    /// # Arguments
    ///
    /// * `step_count` - Number of inference steps
    /// * `spacing` - Timestep spacing; Karras spacing falls back to linspace
    /// * `config` - Training noise schedule parameters
    pub fn new(step_count: usize, spacing: TimestepSpacing, config: &ScheduleConfig) -> Self {
        let spacing = if spacing == TimestepSpacing::Karras {
            tracing::warn!("PNDM does not support karras spacing, using linspace");
            TimestepSpacing::Linspace
        } else {
            spacing
        };

        let schedule = NoiseSchedule::new(config);
        let timesteps = spacing.build(&schedule, step_count);

        Self {
            schedule,
            inference_step_count: step_count,
            timesteps,
            counter: 0,
            ets: Vec::with_capacity(ETS_CAPACITY),
            current_sample: None,
            model_outputs: Vec::with_capacity(step_count),
        }
    }

    /// Creates a scheduler with the Stable Diffusion training schedule.
    pub fn stable_diffusion(step_count: usize) -> Self {
        Self::new(step_count, TimestepSpacing::Linspace, &ScheduleConfig::default())
    }

    /// Number of completed steps.
    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Number of noise residuals currently held for extrapolation.
    pub fn residual_count(&self) -> usize {
        self.ets.len()
    }

    /// Distance between consecutive inference timesteps on the training axis.
    fn step_increment(&self) -> usize {
        self.schedule.train_step_count / self.inference_step_count
    }

    fn clamp_timestep(&self, t: usize) -> usize {
        t.min(self.schedule.train_step_count - 1)
    }

    /// The `k`-th most recent noise residual (1 = newest).
    fn ets_back(&self, k: usize) -> &Tensor {
        &self.ets[self.ets.len() - k]
    }

    /// Reparameterizes a noise residual into a predicted clean sample:
    /// `(sample - output * sigma_t) / alpha_t`.
    pub fn convert_model_output(&self, output: &Tensor, t: usize, sample: &Tensor) -> Tensor {
        let t = self.clamp_timestep(t);
        predicted_original_sample(
            output,
            sample,
            self.timesteps.alpha_t[t],
            self.timesteps.sigma_t[t],
        )
    }

    /// Closed-form transition from `t` to `prev_t` (eq. 9 of the PNDM paper).
    pub fn previous_sample(
        &self,
        sample: &Tensor,
        t: usize,
        prev_t: isize,
        model_output: &Tensor,
    ) -> Tensor {
        let alphas_cum_prod = &self.schedule.alphas_cum_prod;
        let alpha_prod_t = alphas_cum_prod[self.clamp_timestep(t)] as f64;
        let alpha_prod_t_prev = alphas_cum_prod[self.clamp_timestep(prev_t.max(0) as usize)] as f64;
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
        let model_output_denom_coeff = alpha_prod_t * beta_prod_t_prev.sqrt()
            + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();
        let model_coeff = -(alpha_prod_t_prev - alpha_prod_t) / model_output_denom_coeff;

        weighted_sum(&[sample_coeff, model_coeff], &[sample, model_output])
    }

    fn extrapolate(&self, output: &Tensor) -> Tensor {
        match self.ets.len() {
            1 => weighted_sum(&[0.5, 0.5], &[output, self.ets_back(1)]),
            2 => weighted_sum(&[3.0 / 2.0, -1.0 / 2.0], &[self.ets_back(1), self.ets_back(2)]),
            3 => weighted_sum(
                &[23.0 / 12.0, -16.0 / 12.0, 5.0 / 12.0],
                &[self.ets_back(1), self.ets_back(2), self.ets_back(3)],
            ),
            _ => weighted_sum(
                &[55.0 / 24.0, -59.0 / 24.0, 37.0 / 24.0, -9.0 / 24.0],
                &[
                    self.ets_back(1),
                    self.ets_back(2),
                    self.ets_back(3),
                    self.ets_back(4),
                ],
            ),
        }
    }
}

impl Scheduler for PndmScheduler {
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
        let step_inc = self.step_increment();
        let mut time_step = time_step;
        let mut prev_step = time_step as isize - step_inc as isize;

        if self.counter != 1 {
            if self.ets.len() >= ETS_CAPACITY {
                let excess = self.ets.len() - (ETS_CAPACITY - 1);
                self.ets.drain(..excess);
            }
            self.ets.push(output.clone());
        } else {
            prev_step = time_step as isize;
            time_step += step_inc;
        }

        let (model_output, sample) = if self.ets.len() == 1 && self.counter == 0 {
            self.current_sample = Some(sample.clone());
            (output.clone(), sample.clone())
        } else if self.ets.len() == 1 && self.counter == 1 {
            let model_output = self.extrapolate(output);
            let cached = self.current_sample.take().unwrap_or_else(|| sample.clone());
            (model_output, cached)
        } else {
            (self.extrapolate(output), sample.clone())
        };

        let converted = self.convert_model_output(&model_output, time_step, &sample);
        self.model_outputs.push(converted);

        let prev_sample = self.previous_sample(&sample, time_step, prev_step, &model_output);
        tracing::debug!(
            counter = self.counter,
            time_step,
            prev_step,
            residuals = self.ets.len(),
            "pndm step"
        );

        self.counter += 1;
        prev_sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::filled;

    const SHAPE: [usize; 4] = [1, 4, 8, 8];

    /// Scalar version of the closed-form transition for constant tensors.
    fn expected_prev(s: &PndmScheduler, sample: f64, t: usize, prev: isize, m: f64) -> f64 {
        let acp = s.alphas_cum_prod();
        let a_t = acp[t] as f64;
        let a_prev = acp[prev.max(0) as usize] as f64;
        let sample_coeff = (a_prev / a_t).sqrt();
        let denom = a_t * (1.0 - a_prev).sqrt() + (a_t * (1.0 - a_t) * a_prev).sqrt();
        let model_coeff = -(a_prev - a_t) / denom;
        sample_coeff * sample + model_coeff * m
    }

    fn value(t: &Tensor) -> f64 {
        t.iter().next().copied().unwrap() as f64
    }

    fn assert_close(actual: f64, expected: f64) {
        let tolerance = 1e-4 * expected.abs().max(1.0);
        assert!(
            (actual - expected).abs() < tolerance,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn pndm_scheduler_creation() {
        let scheduler = PndmScheduler::stable_diffusion(50);
        assert_eq!(scheduler.inference_step_count(), 50);
        assert_eq!(scheduler.train_step_count(), 1000);
        assert_eq!(scheduler.time_steps().len(), 50);
        assert_eq!(scheduler.counter(), 0);
        assert!(scheduler.model_outputs().is_empty());
    }

    #[test]
    fn karras_spacing_falls_back_to_linspace() {
        let config = ScheduleConfig::default();
        let karras = PndmScheduler::new(20, TimestepSpacing::Karras, &config);
        let linspace = PndmScheduler::new(20, TimestepSpacing::Linspace, &config);
        assert_eq!(karras.time_steps(), linspace.time_steps());
    }

    #[test]
    fn constant_prediction_over_fifty_steps() {
        let mut scheduler = PndmScheduler::stable_diffusion(50);
        let noise = filled(&SHAPE, 0.5);
        let mut latent = filled(&SHAPE, 1.0);

        let time_steps = scheduler.time_steps().to_vec();
        for (i, &t) in time_steps.iter().enumerate() {
            latent = scheduler.step(&noise, t, &latent);
            assert!(scheduler.residual_count() <= ETS_CAPACITY);
            assert_eq!(scheduler.model_outputs().len(), i + 1);
        }

        assert_eq!(scheduler.model_outputs().len(), 50);
        assert_eq!(scheduler.counter(), 50);
        assert!(latent.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn first_call_converts_raw_output() {
        let mut scheduler = PndmScheduler::stable_diffusion(2);
        let t = scheduler.time_steps()[0];
        let sample = filled(&SHAPE, 0.8);
        let ones = filled(&SHAPE, 1.0);

        scheduler.step(&ones, t, &sample);

        let alpha = scheduler.timesteps.alpha_t[t];
        let sigma = scheduler.timesteps.sigma_t[t];
        let expected = (0.8_f32 - 1.0 * sigma) / alpha;
        assert!(scheduler.model_outputs()[0].iter().all(|&v| v == expected));
    }

    #[test]
    fn multistep_weights_follow_residual_count() {
        let mut scheduler = PndmScheduler::stable_diffusion(10);
        let ts = scheduler.time_steps().to_vec();
        let inc = 100;
        assert_eq!(scheduler.step_increment(), inc);

        let e: Vec<f64> = (0..6).map(|k| 0.1 * (k + 1) as f64).collect();
        let out = |k: usize| filled(&SHAPE, e[k] as f32);

        // Call 0: warm-up, raw output, sample cached.
        let x0 = 1.0;
        let x1 = scheduler.step(&out(0), ts[0], &filled(&SHAPE, x0 as f32));
        assert_close(
            value(&x1),
            expected_prev(&scheduler, x0, ts[0], ts[0] as isize - inc as isize, e[0]),
        );
        assert_eq!(scheduler.residual_count(), 1);

        // Call 1: timestep rolled forward, cached sample restored, [1/2, 1/2].
        let x2 = scheduler.step(&out(1), ts[1], &x1);
        let m = 0.5 * e[1] + 0.5 * e[0];
        let t = ts[1] + inc;
        assert_close(value(&x2), expected_prev(&scheduler, x0, t, ts[1] as isize, m));
        assert_eq!(scheduler.residual_count(), 1);

        // Call 2: [3/2, -1/2].
        let x3 = scheduler.step(&out(2), ts[2], &x2);
        let m = 1.5 * e[2] - 0.5 * e[0];
        assert_close(
            value(&x3),
            expected_prev(&scheduler, value(&x2), ts[2], ts[2] as isize - inc as isize, m),
        );

        // Call 3: [23/12, -16/12, 5/12].
        let x4 = scheduler.step(&out(3), ts[3], &x3);
        let m = (23.0 * e[3] - 16.0 * e[2] + 5.0 * e[0]) / 12.0;
        assert_close(
            value(&x4),
            expected_prev(&scheduler, value(&x3), ts[3], ts[3] as isize - inc as isize, m),
        );

        // Call 4: [55/24, -59/24, 37/24, -9/24].
        let x5 = scheduler.step(&out(4), ts[4], &x4);
        let m = (55.0 * e[4] - 59.0 * e[3] + 37.0 * e[2] - 9.0 * e[0]) / 24.0;
        assert_close(
            value(&x5),
            expected_prev(&scheduler, value(&x4), ts[4], ts[4] as isize - inc as isize, m),
        );
        assert_eq!(scheduler.residual_count(), 4);

        // Call 5: oldest residual evicted before the append.
        let x6 = scheduler.step(&out(5), ts[5], &x5);
        let m = (55.0 * e[5] - 59.0 * e[4] + 37.0 * e[3] - 9.0 * e[2]) / 24.0;
        assert_close(
            value(&x6),
            expected_prev(&scheduler, value(&x5), ts[5], ts[5] as isize - inc as isize, m),
        );
        assert_eq!(scheduler.residual_count(), 4);
    }

    #[test]
    fn previous_sample_clamps_to_first_timestep() {
        let scheduler = PndmScheduler::stable_diffusion(10);
        let sample = filled(&SHAPE, 0.3);
        let output = filled(&SHAPE, 0.2);
        let at_zero = scheduler.previous_sample(&sample, 50, 0, &output);
        let below_zero = scheduler.previous_sample(&sample, 50, -50, &output);
        assert_eq!(at_zero, below_zero);
    }
}
