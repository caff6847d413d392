//! DPM-Solver++ (2M): second-order multistep solver on the data prediction.

use candle_core::Tensor;

use super::{predict_x0_and_eps, NoiseSchedule, NoiseSource, PredictionType, Sampler};
use crate::error::Result;

pub struct DpmSolverMultistepSampler {
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
    prediction: PredictionType,
    /// Data prediction and λ of the previous step.
    previous: Option<(Tensor, f64)>,
}

impl DpmSolverMultistepSampler {
    pub fn new(
        schedule: NoiseSchedule,
        num_inference_steps: usize,
        prediction: PredictionType,
    ) -> Result<Self> {
        let timesteps = schedule.leading_timesteps(num_inference_steps)?;
        Ok(Self {
            schedule,
            timesteps,
            prediction,
            previous: None,
        })
    }

    /// (α_t, σ_t, λ_t) in the variance-preserving parameterization.
    fn coefficients(&self, timestep: usize) -> (f64, f64, f64) {
        let alpha_prod = self.schedule.alpha_prod(timestep);
        let alpha_t = alpha_prod.sqrt();
        let sigma_t = (1.0 - alpha_prod).sqrt();
        (alpha_t, sigma_t, alpha_t.ln() - sigma_t.ln())
    }
}

impl Sampler for DpmSolverMultistepSampler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn scale_model_input(&self, sample: Tensor, _step_index: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, step_index: usize) -> Result<Tensor> {
        let (alpha_t, sigma_t, _) = self.coefficients(self.timesteps[step_index]);
        Ok(((original * alpha_t)? + (noise * sigma_t)?)?)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
        _noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let timestep = self.timesteps[step_index];
        let alpha_prod = self.schedule.alpha_prod(timestep);
        let (x0, _) = predict_x0_and_eps(self.prediction, model_output, sample, alpha_prod)?;

        // The final step lands on σ = 0, where the solution is the data prediction.
        let Some(&next_timestep) = self.timesteps.get(step_index + 1) else {
            self.previous = None;
            return Ok(x0);
        };

        let (_, sigma_t, lambda_t) = self.coefficients(timestep);
        let (alpha_next, sigma_next, lambda_next) = self.coefficients(next_timestep);
        let h = lambda_next - lambda_t;
        let phi = (-h).exp() - 1.0;

        let first_order = ((sample * (sigma_next / sigma_t))? - (&x0 * (alpha_next * phi))?)?;
        let prev_sample = match &self.previous {
            Some((prev_x0, prev_lambda)) => {
                let r0 = (lambda_t - prev_lambda) / h;
                let d1 = ((&x0 - prev_x0)? / r0)?;
                (first_order - (d1 * (0.5 * alpha_next * phi))?)?
            }
            None => first_order,
        };

        self.previous = Some((x0, lambda_t));
        Ok(prev_sample)
    }
}
