//! Pseudo numerical methods for diffusion models, run as PLMS: a linear
//! multistep combination of up to four past noise predictions, warmed up with
//! a second-order step on the repeated first timestep.

use burn::tensor::{backend::Backend, Tensor};

use super::{inference_timesteps, NoiseSchedule, Scheduler};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct PndmScheduler<B: Backend> {
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
    step_ratio: usize,
    final_alpha_cumprod: f64,
    ets: Vec<Tensor<B, 4>>,
    counter: usize,
    cur_sample: Option<Tensor<B, 4>>,
}

impl<B: Backend> PndmScheduler<B> {
    pub fn new(
        schedule: &NoiseSchedule,
        num_inference_steps: usize,
        steps_offset: usize,
        set_alpha_to_one: bool,
    ) -> Result<Self> {
        let n_steps = schedule.num_train_timesteps();
        let ascending = inference_timesteps(num_inference_steps, n_steps, steps_offset)?;

        // The second-to-last timestep is visited twice: once for the Euler
        // warm-up and once for its second-order correction.
        let mut timesteps = Vec::with_capacity(ascending.len() + 1);
        if let Some((&last, rest)) = ascending.split_last() {
            timesteps.extend_from_slice(rest);
            timesteps.extend(rest.last().copied());
            timesteps.push(last);
        }
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
            ets: Vec::new(),
            counter: 0,
            cur_sample: None,
        })
    }

    fn prev_sample(
        &self,
        sample: Tensor<B, 4>,
        timestep: usize,
        prev_timestep: Option<usize>,
        model_output: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>> {
        let alpha_prod_t = self.schedule.alpha_cumprod(timestep)?;
        let alpha_prod_t_prev = match prev_timestep {
            Some(prev) => self.schedule.alpha_cumprod(prev)?,
            None => self.final_alpha_cumprod,
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
        let model_output_denom_coeff = alpha_prod_t * beta_prod_t_prev.sqrt()
            + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();

        Ok(sample * sample_coeff
            - model_output * ((alpha_prod_t_prev - alpha_prod_t) / model_output_denom_coeff))
    }
}

impl<B: Backend> Scheduler<B> for PndmScheduler<B> {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>> {
        self.schedule.alpha_cumprod(timestep)?;

        let (timestep, prev_timestep) = if self.counter == 1 {
            (timestep + self.step_ratio, Some(timestep))
        } else {
            if self.ets.len() > 3 {
                self.ets.remove(0);
            }
            self.ets.push(model_output.clone());
            (timestep, timestep.checked_sub(self.step_ratio))
        };

        let ets = &self.ets;
        let (model_output, sample) = match (ets.len(), self.counter) {
            (1, 0) => {
                self.cur_sample = Some(sample.clone());
                (model_output, sample)
            }
            (1, _) => {
                let cur_sample = self.cur_sample.take().ok_or_else(|| {
                    Error::invalid_input("second-order warm-up step without a first step")
                })?;
                ((model_output + ets[0].clone()) / 2.0, cur_sample)
            }
            (2, _) => ((ets[1].clone() * 3.0 - ets[0].clone()) / 2.0, sample),
            (3, _) => (
                (ets[2].clone() * 23.0 - ets[1].clone() * 16.0 + ets[0].clone() * 5.0) / 12.0,
                sample,
            ),
            _ => (
                (ets[3].clone() * 55.0 - ets[2].clone() * 59.0 + ets[1].clone() * 37.0
                    - ets[0].clone() * 9.0)
                    / 24.0,
                sample,
            ),
        };

        let prev_sample = self.prev_sample(sample, timestep, prev_timestep, model_output)?;
        self.counter += 1;

        Ok(prev_sample)
    }
}
