//! Deterministic DDIM sampling (eta = 0).

use burn::tensor::{backend::Backend, Tensor};

use super::{inference_timesteps, NoiseSchedule, Scheduler};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct DdimScheduler {
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
    step_ratio: usize,
    final_alpha_cumprod: f64,
}

impl DdimScheduler {
    pub fn new(
        schedule: &NoiseSchedule,
        num_inference_steps: usize,
        steps_offset: usize,
        set_alpha_to_one: bool,
    ) -> Result<Self> {
        let n_steps = schedule.num_train_timesteps();
        let mut timesteps = inference_timesteps(num_inference_steps, n_steps, steps_offset)?;
        timesteps.reverse();

        let step_ratio = n_steps / num_inference_steps.max(1);
        let final_alpha_cumprod = if set_alpha_to_one {
            1.0
        } else {
            schedule.alpha_cumprod(0)?
        };

        Ok(Self {
            schedule: schedule.clone(),
            timesteps,
            step_ratio,
            final_alpha_cumprod,
        })
    }
}

impl<B: Backend> Scheduler<B> for DdimScheduler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>> {
        let current_alpha = self.schedule.alpha_cumprod(timestep)?;
        let prev_alpha = match timestep.checked_sub(self.step_ratio) {
            Some(prev) => self.schedule.alpha_cumprod(prev)?,
            None => self.final_alpha_cumprod,
        };

        let sqrt_noise = (1.0 - current_alpha).sqrt();

        let predx0 = (sample - model_output.clone() * sqrt_noise) / current_alpha.sqrt();
        let dir_latent = model_output * (1.0 - prev_alpha).sqrt();

        Ok(predx0 * prev_alpha.sqrt() + dir_latent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn scheduler(n: usize) -> DdimScheduler {
        let schedule = NoiseSchedule::scaled_linear(1000, 0.00085, 0.012).unwrap();
        DdimScheduler::new(&schedule, n, 0, false).unwrap()
    }

    #[test]
    fn timesteps_descend_to_zero() {
        let timesteps = <DdimScheduler as Scheduler<TestBackend>>::timesteps(&scheduler(50)).to_vec();

        assert_eq!(timesteps.len(), 50);
        assert_eq!(timesteps[0], 980);
        assert_eq!(timesteps[49], 0);
        assert!(timesteps.windows(2).all(|pair| pair[1] < pair[0]));
    }

    #[test]
    fn zero_steps_gives_empty_schedule() {
        let scheduler = scheduler(0);
        assert!(<DdimScheduler as Scheduler<TestBackend>>::timesteps(&scheduler).is_empty());
    }

    #[test]
    fn exact_noise_prediction_recovers_less_noisy_latent() {
        let device = Default::default();
        let schedule = NoiseSchedule::scaled_linear(1000, 0.00085, 0.012).unwrap();
        let mut scheduler = DdimScheduler::new(&schedule, 10, 0, false).unwrap();

        let x0 = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device) * 0.3;
        let noise = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device) * -0.7;
        let x_t = schedule.add_noise(x0.clone(), noise.clone(), 500).unwrap();

        let prev = scheduler.step(noise.clone(), 500, x_t).unwrap();
        let expected = schedule.add_noise(x0, noise, 400).unwrap();

        prev.into_data().assert_approx_eq(&expected.into_data(), 4);
    }

    #[test]
    fn rejects_out_of_range_timestep() {
        let device = Default::default();
        let mut scheduler = scheduler(10);
        let x = Tensor::<TestBackend, 4>::zeros([1, 4, 2, 2], &device);

        assert!(scheduler.step(x.clone(), 1000, x).is_err());
    }
}
