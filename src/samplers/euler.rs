//! Euler and Euler-ancestral samplers (Karras sigma parameterization).

use candle_core::Tensor;

use super::{NoiseSchedule, NoiseSource, PredictionType, Sampler};
use crate::error::Result;

/// Sigmas for the chosen timesteps, with a trailing zero.
struct SigmaSchedule {
    timesteps: Vec<usize>,
    sigmas: Vec<f64>,
    prediction: PredictionType,
}

impl SigmaSchedule {
    fn new(
        schedule: &NoiseSchedule,
        num_inference_steps: usize,
        prediction: PredictionType,
    ) -> Result<Self> {
        let timesteps = schedule.leading_timesteps(num_inference_steps)?;
        let mut sigmas: Vec<f64> = timesteps.iter().map(|&t| schedule.sigma(t)).collect();
        sigmas.push(0.0);
        Ok(Self {
            timesteps,
            sigmas,
            prediction,
        })
    }

    fn scale_model_input(&self, sample: Tensor, step_index: usize) -> Result<Tensor> {
        let sigma = self.sigmas[step_index];
        Ok((sample / (sigma * sigma + 1.0).sqrt())?)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, step_index: usize) -> Result<Tensor> {
        Ok((original + (noise * self.sigmas[step_index])?)?)
    }

    /// Returns (derivative, sigma, sigma_next).
    fn derivative(
        &self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
    ) -> Result<(Tensor, f64, f64)> {
        let sigma = self.sigmas[step_index];
        let sigma_next = self.sigmas[step_index + 1];
        let pred_original_sample = match self.prediction {
            PredictionType::Epsilon => (sample - (model_output * sigma)?)?,
            PredictionType::VPrediction => {
                let c_out = -sigma / (sigma * sigma + 1.0).sqrt();
                let c_skip = 1.0 / (sigma * sigma + 1.0);
                ((model_output * c_out)? + (sample * c_skip)?)?
            }
        };
        let derivative = ((sample - pred_original_sample)? / sigma)?;
        Ok((derivative, sigma, sigma_next))
    }
}

pub struct EulerSampler {
    sigmas: SigmaSchedule,
}

impl EulerSampler {
    pub fn new(
        schedule: NoiseSchedule,
        num_inference_steps: usize,
        prediction: PredictionType,
    ) -> Result<Self> {
        Ok(Self {
            sigmas: SigmaSchedule::new(&schedule, num_inference_steps, prediction)?,
        })
    }
}

impl Sampler for EulerSampler {
    fn timesteps(&self) -> &[usize] {
        &self.sigmas.timesteps
    }

    fn scale_model_input(&self, sample: Tensor, step_index: usize) -> Result<Tensor> {
        self.sigmas.scale_model_input(sample, step_index)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, step_index: usize) -> Result<Tensor> {
        self.sigmas.add_noise(original, noise, step_index)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
        _noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let (derivative, sigma, sigma_next) =
            self.sigmas.derivative(model_output, step_index, sample)?;
        Ok((sample + (derivative * (sigma_next - sigma))?)?)
    }
}

pub struct EulerAncestralSampler {
    sigmas: SigmaSchedule,
}

impl EulerAncestralSampler {
    pub fn new(
        schedule: NoiseSchedule,
        num_inference_steps: usize,
        prediction: PredictionType,
    ) -> Result<Self> {
        Ok(Self {
            sigmas: SigmaSchedule::new(&schedule, num_inference_steps, prediction)?,
        })
    }
}

impl Sampler for EulerAncestralSampler {
    fn timesteps(&self) -> &[usize] {
        &self.sigmas.timesteps
    }

    fn scale_model_input(&self, sample: Tensor, step_index: usize) -> Result<Tensor> {
        self.sigmas.scale_model_input(sample, step_index)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, step_index: usize) -> Result<Tensor> {
        self.sigmas.add_noise(original, noise, step_index)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
        noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let (derivative, sigma, sigma_next) =
            self.sigmas.derivative(model_output, step_index, sample)?;

        let sigma_up = (sigma_next.powi(2) * (sigma.powi(2) - sigma_next.powi(2)) / sigma.powi(2))
            .max(0.0)
            .sqrt();
        let sigma_down = (sigma_next.powi(2) - sigma_up.powi(2)).max(0.0).sqrt();

        let prev_sample = (sample + (derivative * (sigma_down - sigma))?)?;
        if sigma_up == 0.0 {
            return Ok(prev_sample);
        }
        let step_noise = noise.randn_like(sample)?;
        Ok((prev_sample + (step_noise * sigma_up)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmas_end_at_zero() {
        let sampler = EulerSampler::new(NoiseSchedule::sdxl(), 25, PredictionType::Epsilon).unwrap();
        let sigmas = &sampler.sigmas.sigmas;
        assert_eq!(sigmas.len(), 26);
        assert_eq!(*sigmas.last().unwrap(), 0.0);
        assert!(sigmas.windows(2).all(|w| w[0] > w[1]));
        // Leading spacing starts below the top of the schedule.
        assert!(sampler.timesteps()[0] < crate::samplers::TRAIN_TIMESTEPS);
    }
}
