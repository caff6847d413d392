//! DDPM ancestral sampler with the "fixed small" posterior variance.

use candle_core::Tensor;

use super::{predict_x0_and_eps, NoiseSchedule, NoiseSource, PredictionType, Sampler};
use crate::error::Result;

pub struct DdpmSampler {
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
    prediction: PredictionType,
}

impl DdpmSampler {
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
        })
    }
}

impl Sampler for DdpmSampler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn scale_model_input(&self, sample: Tensor, _step_index: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, step_index: usize) -> Result<Tensor> {
        let alpha_prod = self.schedule.alpha_prod(self.timesteps[step_index]);
        Ok(((original * alpha_prod.sqrt())? + (noise * (1.0 - alpha_prod).sqrt())?)?)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
        noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let prev_timestep = self.timesteps.get(step_index + 1).copied();
        let alpha_prod_t = self.schedule.alpha_prod(self.timesteps[step_index]);
        let alpha_prod_t_prev = prev_timestep.map_or(1.0, |t| self.schedule.alpha_prod(t));
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;
        let current_alpha_t = alpha_prod_t / alpha_prod_t_prev;
        let current_beta_t = 1.0 - current_alpha_t;

        let (pred_original_sample, _) =
            predict_x0_and_eps(self.prediction, model_output, sample, alpha_prod_t)?;

        // Posterior mean μ_t = c0 x_0 + ct x_t
        let original_coef = alpha_prod_t_prev.sqrt() * current_beta_t / beta_prod_t;
        let current_coef = current_alpha_t.sqrt() * beta_prod_t_prev / beta_prod_t;
        let mean = ((pred_original_sample * original_coef)? + (sample * current_coef)?)?;

        if prev_timestep.is_none() {
            return Ok(mean);
        }

        let variance = (beta_prod_t_prev / beta_prod_t * current_beta_t).max(1e-20);
        let variance_noise = noise.randn_like(sample)?;
        Ok((mean + (variance_noise * variance.sqrt())?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_final_step_returns_predicted_original() -> Result<()> {
        let device = Device::Cpu;
        let mut sampler = DdpmSampler::new(NoiseSchedule::sdxl(), 4, PredictionType::Epsilon)?;
        let last = sampler.timesteps().len() - 1;
        let sample = Tensor::full(0.3f32, (1, 4, 2, 2), &device)?;
        let zero = Tensor::zeros((1, 4, 2, 2), DType::F32, &device)?;

        // Zero noise prediction at the final step: x_0 = x_t / sqrt(ᾱ_t).
        let out = sampler.step(&zero, last, &sample, &mut NoiseSource::new(0))?;
        let expected = 0.3 / sampler.schedule.alpha_prod(sampler.timesteps()[last]).sqrt();
        let got: Vec<f32> = out.flatten_all()?.to_vec1()?;
        assert!(got.iter().all(|v| (*v as f64 - expected).abs() < 1e-5));
        Ok(())
    }
}
