//! Noise schedules and the reverse-diffusion schedulers driven by the sampler.

pub mod ddim;
pub mod pndm;

use burn::{
    config::Config,
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::error::{self, Error};
use ddim::DdimScheduler;
use pndm::PndmScheduler;

/// One run of a reverse-diffusion scheduler over a reduced timestep schedule.
pub trait Scheduler<B: Backend> {
    /// Timesteps to visit, from most to least noisy.
    fn timesteps(&self) -> &[usize];

    /// Advances `sample` one step given the predicted noise at `timestep`.
    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
    ) -> error::Result<Tensor<B, 4>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerKind {
    Ddim,
    Pndm,
}

/// How beta evolves over the training timesteps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetaSchedule {
    Linear,
    /// Linear in the square root of beta.
    ScaledLinear,
    SquaredcosCapV2,
}

#[derive(Config, Debug)]
pub struct SchedulerConfig {
    #[config(default = "SchedulerKind::Ddim")]
    pub kind: SchedulerKind,
    #[config(default = 1000)]
    pub num_train_timesteps: usize,
    #[config(default = 0.00085)]
    pub beta_start: f64,
    #[config(default = 0.012)]
    pub beta_end: f64,
    #[config(default = "BetaSchedule::ScaledLinear")]
    pub beta_schedule: BetaSchedule,
    #[config(default = 0)]
    pub steps_offset: usize,
    #[config(default = false)]
    pub set_alpha_to_one: bool,
}

impl SchedulerConfig {
    pub fn init_schedule(&self) -> error::Result<NoiseSchedule> {
        let n = self.num_train_timesteps;
        match self.beta_schedule {
            BetaSchedule::Linear => NoiseSchedule::linear(n, self.beta_start, self.beta_end),
            BetaSchedule::ScaledLinear => {
                NoiseSchedule::scaled_linear(n, self.beta_start, self.beta_end)
            }
            BetaSchedule::SquaredcosCapV2 => NoiseSchedule::squaredcos_cap_v2(n, 0.999),
        }
    }

    /// Creates a fresh scheduler for one sampling run of `num_inference_steps`.
    pub fn build<B: Backend>(
        &self,
        schedule: &NoiseSchedule,
        num_inference_steps: usize,
    ) -> error::Result<Box<dyn Scheduler<B>>> {
        Ok(match self.kind {
            SchedulerKind::Ddim => Box::new(DdimScheduler::new(
                schedule,
                num_inference_steps,
                self.steps_offset,
                self.set_alpha_to_one,
            )?),
            SchedulerKind::Pndm => Box::new(PndmScheduler::<B>::new(
                schedule,
                num_inference_steps,
                self.steps_offset,
                self.set_alpha_to_one,
            )?),
        })
    }
}

/// The cumulative product of alphas, indexed by training timestep.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn from_alphas_cumprod(alphas_cumprod: Vec<f64>) -> error::Result<Self> {
        if alphas_cumprod.is_empty() {
            return Err(Error::Config("noise schedule has no timesteps".into()));
        }
        if let Some(bad) = alphas_cumprod.iter().find(|&&a| !(a > 0.0 && a <= 1.0)) {
            return Err(Error::Config(format!(
                "cumulative alpha {} is outside (0, 1]",
                bad
            )));
        }

        Ok(Self { alphas_cumprod })
    }

    pub fn from_betas(betas: &[f64]) -> error::Result<Self> {
        let alphas_cumprod = betas
            .iter()
            .scan(1.0, |cumprod, beta| {
                *cumprod *= 1.0 - beta;
                Some(*cumprod)
            })
            .collect();

        Self::from_alphas_cumprod(alphas_cumprod)
    }

    pub fn linear(n_steps: usize, beta_start: f64, beta_end: f64) -> error::Result<Self> {
        Self::from_betas(&linspace(beta_start, beta_end, n_steps))
    }

    /// The schedule Stable Diffusion 1.x was trained with.
    pub fn scaled_linear(n_steps: usize, beta_start: f64, beta_end: f64) -> error::Result<Self> {
        let betas: Vec<f64> = linspace(beta_start.sqrt(), beta_end.sqrt(), n_steps)
            .into_iter()
            .map(|b| b * b)
            .collect();
        Self::from_betas(&betas)
    }

    pub fn squaredcos_cap_v2(n_steps: usize, max_beta: f64) -> error::Result<Self> {
        let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);

        let betas: Vec<f64> = (0..n_steps)
            .map(|i| {
                let t1 = i as f64 / n_steps as f64;
                let t2 = (i + 1) as f64 / n_steps as f64;
                (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
            })
            .collect();
        Self::from_betas(&betas)
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn alpha_cumprod(&self, timestep: usize) -> error::Result<f64> {
        self.alphas_cumprod.get(timestep).copied().ok_or_else(|| {
            Error::invalid_input(format!(
                "timestep {} is outside [0, {})",
                timestep,
                self.num_train_timesteps()
            ))
        })
    }

    /// Forward-noises `original` to `timestep`.
    pub fn add_noise<B: Backend>(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timestep: usize,
    ) -> error::Result<Tensor<B, 4>> {
        if original.dims() != noise.dims() {
            return Err(Error::shape_mismatch(format!(
                "noise {:?} does not match latents {:?}",
                noise.dims(),
                original.dims()
            )));
        }

        let alpha = self.alpha_cumprod(timestep)?;
        Ok(original * alpha.sqrt() + noise * (1.0 - alpha).sqrt())
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// The evenly spaced training timesteps a run of `num_inference_steps` visits,
/// in ascending order.
pub(crate) fn inference_timesteps(
    num_inference_steps: usize,
    num_train_timesteps: usize,
    steps_offset: usize,
) -> error::Result<Vec<usize>> {
    if num_inference_steps > num_train_timesteps {
        return Err(Error::invalid_input(format!(
            "{} inference steps exceed the {} training timesteps",
            num_inference_steps, num_train_timesteps
        )));
    }
    if num_inference_steps == 0 {
        return Ok(Vec::new());
    }

    let step_ratio = num_train_timesteps / num_inference_steps;
    let timesteps: Vec<usize> = (0..num_inference_steps)
        .map(|i| i * step_ratio + steps_offset)
        .collect();

    match timesteps.last() {
        Some(&last) if last >= num_train_timesteps => Err(Error::invalid_input(format!(
            "steps offset {} pushes timestep {} past the schedule",
            steps_offset, last
        ))),
        _ => Ok(timesteps),
    }
}
