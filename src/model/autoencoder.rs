use burn::tensor::{backend::Backend, Distribution, Tensor};

/// A variational autoencoder mapping pixels to a compressed latent space.
pub trait Autoencoder<B: Backend> {
    /// Encodes images with values in [-1, 1] into a distribution over latents.
    fn encode(&self, images: Tensor<B, 4>) -> DiagonalGaussian<B>;

    /// Decodes unscaled latents back to images with values roughly in [-1, 1].
    fn decode(&self, latents: Tensor<B, 4>) -> Tensor<B, 4>;
}

#[derive(Debug, Clone)]
pub struct DiagonalGaussian<B: Backend> {
    mean: Tensor<B, 4>,
    logvar: Tensor<B, 4>,
}

impl<B: Backend> DiagonalGaussian<B> {
    pub fn new(mean: Tensor<B, 4>, logvar: Tensor<B, 4>) -> Self {
        let logvar = logvar.clamp(-30.0, 20.0);
        Self { mean, logvar }
    }

    /// Splits encoder moments `[n, 2 * c, h, w]` into mean and log-variance.
    pub fn from_moments(moments: Tensor<B, 4>) -> Self {
        let [n_batch, n_channel, _, _] = moments.dims();
        let half = n_channel / 2;

        let mean = moments.clone().slice([0..n_batch, 0..half]);
        let logvar = moments.slice([0..n_batch, half..n_channel]);

        Self::new(mean, logvar)
    }

    pub fn mean(&self) -> Tensor<B, 4> {
        self.mean.clone()
    }

    /// Draws one reparameterized sample, differentiable w.r.t. the moments.
    pub fn sample(&self) -> Tensor<B, 4> {
        let std = (self.logvar.clone() * 0.5).exp();
        let eps = Tensor::random(
            self.mean.shape(),
            Distribution::Normal(0.0, 1.0),
            &self.mean.device(),
        );

        self.mean.clone() + std * eps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Data;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn moments_split_into_mean_and_clamped_logvar() {
        let device = Default::default();
        let moments = Tensor::<TestBackend, 4>::from_data(
            Data::from([[[[1.0]], [[2.0]], [[-100.0]], [[50.0]]]]),
            &device,
        );

        let posterior = DiagonalGaussian::from_moments(moments);
        assert_eq!(posterior.mean().dims(), [1, 2, 1, 1]);
        posterior
            .mean()
            .into_data()
            .assert_approx_eq(&Data::from([[[[1.0]], [[2.0]]]]), 5);
        posterior
            .logvar
            .clone()
            .into_data()
            .assert_approx_eq(&Data::from([[[[-30.0]], [[20.0]]]]), 5);
    }

    #[test]
    fn near_zero_variance_samples_the_mean() {
        let device = Default::default();
        let mean = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device) * 3.0;
        let logvar = Tensor::<TestBackend, 4>::zeros([1, 4, 2, 2], &device) - 60.0;

        let sample = DiagonalGaussian::new(mean.clone(), logvar).sample();
        sample.into_data().assert_approx_eq(&mean.into_data(), 4);
    }
}
