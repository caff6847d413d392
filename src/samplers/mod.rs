//! Noise samplers for the img2img denoising loop.
//!
//! Every sampler walks the SDXL training schedule (1000 steps, scaled-linear
//! betas from 0.00085 to 0.012) with "leading" timestep spacing. Samplers are
//! addressed by step index rather than timestep value so that img2img can
//! start part-way through the schedule.

mod ddim;
mod ddpm;
mod dpm_solver;
mod euler;

pub use ddim::DdimSampler;
pub use ddpm::DdpmSampler;
pub use dpm_solver::DpmSolverMultistepSampler;
pub use euler::{EulerAncestralSampler, EulerSampler};

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{Error, Result};

pub const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;
const STEPS_OFFSET: usize = 1;

/// What the UNet predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

/// Common interface for all samplers.
pub trait Sampler {
    /// Timesteps in denoising order (descending).
    fn timesteps(&self) -> &[usize];

    /// Scale the denoising input for the model at `step_index`.
    fn scale_model_input(&self, sample: Tensor, step_index: usize) -> Result<Tensor>;

    /// Noise clean latents up to the noise level of `step_index`.
    fn add_noise(&self, original: &Tensor, noise: &Tensor, step_index: usize) -> Result<Tensor>;

    /// Advance `sample` from `step_index` to the next step.
    fn step(
        &mut self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
        noise: &mut NoiseSource,
    ) -> Result<Tensor>;
}

/// Registered sampler algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    Ddpm,
    Ddim,
    Euler,
    EulerAncestral,
    DpmSolverMultistep,
}

const REGISTRY: &[(&str, SamplerKind)] = &[
    ("ddpm", SamplerKind::Ddpm),
    ("ddim", SamplerKind::Ddim),
    ("euler", SamplerKind::Euler),
    ("k_euler", SamplerKind::Euler),
    ("euler_a", SamplerKind::EulerAncestral),
    ("euler_ancestral", SamplerKind::EulerAncestral),
    ("k_euler_a", SamplerKind::EulerAncestral),
    ("dpmsolver++", SamplerKind::DpmSolverMultistep),
    ("dpm++_2m", SamplerKind::DpmSolverMultistep),
    ("dpmsolver", SamplerKind::DpmSolverMultistep),
];

impl SamplerKind {
    pub fn from_name(name: &str) -> Result<Self> {
        let key = name.trim().to_ascii_lowercase();
        REGISTRY
            .iter()
            .find(|(alias, _)| *alias == key)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| Error::UnknownSampler {
                name: name.to_string(),
                supported: REGISTRY
                    .iter()
                    .map(|(alias, _)| *alias)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SamplerKind::Ddpm => "ddpm",
            SamplerKind::Ddim => "ddim",
            SamplerKind::Euler => "euler",
            SamplerKind::EulerAncestral => "euler_a",
            SamplerKind::DpmSolverMultistep => "dpmsolver++",
        }
    }

    /// Build a fresh sampler for `steps` inference steps.
    pub fn build(&self, steps: usize, prediction: PredictionType) -> Result<Box<dyn Sampler>> {
        let schedule = NoiseSchedule::sdxl();
        Ok(match self {
            SamplerKind::Ddpm => Box::new(DdpmSampler::new(schedule, steps, prediction)?),
            SamplerKind::Ddim => Box::new(DdimSampler::new(schedule, steps, prediction, 0.0)?),
            SamplerKind::Euler => Box::new(EulerSampler::new(schedule, steps, prediction)?),
            SamplerKind::EulerAncestral => {
                Box::new(EulerAncestralSampler::new(schedule, steps, prediction)?)
            }
            SamplerKind::DpmSolverMultistep => {
                Box::new(DpmSolverMultistepSampler::new(schedule, steps, prediction)?)
            }
        })
    }
}

/// Cumulative alpha products of the training noise schedule.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn scaled_linear(num_train_timesteps: usize, beta_start: f64, beta_end: f64) -> Self {
        let start = beta_start.sqrt();
        let end = beta_end.sqrt();
        let mut cumprod = 1.0;
        let alphas_cumprod = (0..num_train_timesteps)
            .map(|i| {
                let beta = start + (end - start) * (i as f64) / (num_train_timesteps as f64 - 1.0);
                cumprod *= 1.0 - beta * beta;
                cumprod
            })
            .collect();
        Self { alphas_cumprod }
    }

    pub fn sdxl() -> Self {
        Self::scaled_linear(TRAIN_TIMESTEPS, BETA_START, BETA_END)
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn alpha_prod(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep]
    }

    /// `steps` timesteps, descending, evenly spaced from the start of the schedule.
    pub fn leading_timesteps(&self, steps: usize) -> Result<Vec<usize>> {
        let train = self.num_train_timesteps();
        if steps == 0 || steps > train {
            return Err(Error::invalid(
                "generate.sample_steps",
                format!("must be between 1 and {train}, got {steps}"),
            ));
        }
        let step_ratio = train / steps;
        Ok((0..steps)
            .rev()
            .map(|i| (i * step_ratio + STEPS_OFFSET).min(train - 1))
            .collect())
    }

    /// Karras-style sigma for a timestep: sqrt((1 - ᾱ) / ᾱ).
    pub fn sigma(&self, timestep: usize) -> f64 {
        let alpha = self.alpha_prod(timestep);
        ((1.0 - alpha) / alpha).sqrt()
    }
}

/// Split a model output into predicted clean sample and predicted noise.
pub(crate) fn predict_x0_and_eps(
    prediction: PredictionType,
    model_output: &Tensor,
    sample: &Tensor,
    alpha_prod: f64,
) -> Result<(Tensor, Tensor)> {
    let sqrt_alpha = alpha_prod.sqrt();
    let sqrt_one_minus_alpha = (1.0 - alpha_prod).sqrt();
    Ok(match prediction {
        PredictionType::Epsilon => {
            // x_0 = (x_t - sqrt(1 - ᾱ) ε) / sqrt(ᾱ)
            let x0 = ((sample - (model_output * sqrt_one_minus_alpha)?)? / sqrt_alpha)?;
            (x0, model_output.clone())
        }
        PredictionType::VPrediction => {
            let x0 = ((sample * sqrt_alpha)? - (model_output * sqrt_one_minus_alpha)?)?;
            let eps = ((model_output * sqrt_alpha)? + (sample * sqrt_one_minus_alpha)?)?;
            (x0, eps)
        }
    })
}

/// Seeded Gaussian noise shared by the pipeline and stochastic samplers.
pub struct NoiseSource {
    rng: StdRng,
}

impl NoiseSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Standard normal noise with the shape, dtype and device of `like`.
    pub fn randn_like(&mut self, like: &Tensor) -> Result<Tensor> {
        let data: Vec<f32> = (0..like.elem_count())
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(data, like.dims(), like.device())?.to_dtype(like.dtype())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_registry_aliases() {
        assert_eq!(SamplerKind::from_name("DDPM").unwrap(), SamplerKind::Ddpm);
        assert_eq!(SamplerKind::from_name("k_euler_a").unwrap(), SamplerKind::EulerAncestral);
        assert_eq!(
            SamplerKind::from_name("dpm++_2m").unwrap(),
            SamplerKind::DpmSolverMultistep
        );
        match SamplerKind::from_name("plms") {
            Err(Error::UnknownSampler { name, supported }) => {
                assert_eq!(name, "plms");
                assert!(supported.contains("ddim"));
            }
            other => panic!("expected unknown sampler, got {other:?}"),
        }
    }

    #[test]
    fn test_schedule_is_monotonic() {
        let schedule = NoiseSchedule::sdxl();
        assert_eq!(schedule.num_train_timesteps(), 1000);
        assert!(schedule.alpha_prod(0) > 0.99);
        assert!(schedule.alpha_prod(999) < 0.01);
        assert!(schedule.sigma(999) > schedule.sigma(0));
    }

    #[test]
    fn test_leading_timesteps() {
        let schedule = NoiseSchedule::sdxl();
        let timesteps = schedule.leading_timesteps(20).unwrap();
        assert_eq!(timesteps.len(), 20);
        assert_eq!(timesteps[0], 951);
        assert_eq!(timesteps[19], 1);
        assert!(timesteps.windows(2).all(|w| w[0] > w[1]));
        assert!(schedule.leading_timesteps(0).is_err());
        assert!(schedule.leading_timesteps(1001).is_err());
    }

    #[test]
    fn test_noise_source_is_deterministic() -> Result<()> {
        let like = Tensor::zeros((1, 4, 8, 8), DType::F16, &Device::Cpu)?;
        let a = NoiseSource::new(7).randn_like(&like)?;
        let b = NoiseSource::new(7).randn_like(&like)?;
        let c = NoiseSource::new(8).randn_like(&like)?;
        assert_eq!(a.dtype(), DType::F16);
        assert_eq!(a.dims(), like.dims());

        let diff_same = (a.to_dtype(DType::F32)? - b.to_dtype(DType::F32)?)?
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        let diff_other = (a.to_dtype(DType::F32)? - c.to_dtype(DType::F32)?)?
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert_eq!(diff_same, 0.0);
        assert!(diff_other > 0.0);
        Ok(())
    }

    #[test]
    fn test_every_sampler_denoises_a_perfect_prediction() -> Result<()> {
        // With an oracle noise prediction each sampler must land near the
        // clean latents once the schedule is exhausted.
        let device = Device::Cpu;
        let clean = Tensor::full(0.5f32, (1, 4, 2, 2), &device)?;
        let eps = Tensor::ones((1, 4, 2, 2), DType::F32, &device)?;
        for (_, kind) in REGISTRY {
            let mut sampler = kind.build(10, PredictionType::Epsilon)?;
            let mut noise = NoiseSource::new(0);
            let mut latents = sampler.add_noise(&clean, &eps, 0)?;
            for i in 0..sampler.timesteps().len() {
                let t = sampler.timesteps()[i];
                let oracle = oracle_epsilon(*kind, &latents, &clean, t)?;
                latents = sampler.step(&oracle, i, &latents, &mut noise)?;
            }
            let err = (latents - &clean)?
                .abs()?
                .flatten_all()?
                .max(0)?
                .to_scalar::<f32>()?;
            assert!(err < 0.05, "{} ended {err} away from the clean sample", kind.name());
        }
        Ok(())
    }

    // The ε that exactly explains `latents` given the clean sample, in each
    // sampler's own parameterization.
    fn oracle_epsilon(
        kind: SamplerKind,
        latents: &Tensor,
        clean: &Tensor,
        timestep: usize,
    ) -> Result<Tensor> {
        let schedule = NoiseSchedule::sdxl();
        match kind {
            SamplerKind::Euler | SamplerKind::EulerAncestral => {
                Ok(((latents - clean)? / schedule.sigma(timestep))?)
            }
            _ => {
                let alpha = schedule.alpha_prod(timestep);
                Ok(((latents - (clean * alpha.sqrt())?)? / (1.0 - alpha).sqrt())?)
            }
        }
    }
}
