//! DDIM sampler.

use candle_core::Tensor;

use super::{predict_x0_and_eps, NoiseSchedule, NoiseSource, PredictionType, Sampler};
use crate::error::Result;

pub struct DdimSampler {
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
    prediction: PredictionType,
    /// 0 is deterministic DDIM, 1 matches DDPM variance.
    eta: f64,
}

impl DdimSampler {
    pub fn new(
        schedule: NoiseSchedule,
        num_inference_steps: usize,
        prediction: PredictionType,
        eta: f64,
    ) -> Result<Self> {
        let timesteps = schedule.leading_timesteps(num_inference_steps)?;
        Ok(Self {
            schedule,
            timesteps,
            prediction,
            eta,
        })
    }

    // SDXL does not set the final alpha to one.
    fn alpha_prod_prev(&self, step_index: usize) -> f64 {
        match self.timesteps.get(step_index + 1) {
            Some(&prev) => self.schedule.alpha_prod(prev),
            None => self.schedule.alpha_prod(0),
        }
    }
}

impl Sampler for DdimSampler {
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
        let alpha_prod_t = self.schedule.alpha_prod(self.timesteps[step_index]);
        let alpha_prod_t_prev = self.alpha_prod_prev(step_index);
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let (pred_original_sample, pred_epsilon) =
            predict_x0_and_eps(self.prediction, model_output, sample, alpha_prod_t)?;

        let variance = (beta_prod_t_prev / beta_prod_t) * (1.0 - alpha_prod_t / alpha_prod_t_prev);
        let std_dev_t = self.eta * variance.max(0.0).sqrt();

        // x_t-1 = sqrt(ᾱ_t-1) x_0 + sqrt(1 - ᾱ_t-1 - σ²) ε + σ z
        let direction_coef = (beta_prod_t_prev - std_dev_t * std_dev_t).max(0.0).sqrt();
        let prev_sample = ((pred_original_sample * alpha_prod_t_prev.sqrt())?
            + (pred_epsilon * direction_coef)?)?;

        if std_dev_t > 0.0 {
            let variance_noise = noise.randn_like(sample)?;
            Ok((prev_sample + (variance_noise * std_dev_t)?)?)
        } else {
            Ok(prev_sample)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_ddim_scheduler_creation() {
        let sampler =
            DdimSampler::new(NoiseSchedule::sdxl(), 30, PredictionType::Epsilon, 0.0).unwrap();
        assert_eq!(sampler.timesteps().len(), 30);
        assert!(sampler.timesteps().windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_eta_zero_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let sample = Tensor::ones((1, 4, 2, 2), DType::F32, &device)?;
        let output = Tensor::full(0.1f32, (1, 4, 2, 2), &device)?;

        let mut a = DdimSampler::new(NoiseSchedule::sdxl(), 10, PredictionType::Epsilon, 0.0)?;
        let mut b = DdimSampler::new(NoiseSchedule::sdxl(), 10, PredictionType::Epsilon, 0.0)?;
        let x = a.step(&output, 0, &sample, &mut NoiseSource::new(1))?;
        let y = b.step(&output, 0, &sample, &mut NoiseSource::new(2))?;

        let diff = (x - y)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
