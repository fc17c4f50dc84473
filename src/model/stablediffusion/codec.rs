use std::marker::PhantomData;

use burn::tensor::{backend::Backend, Tensor};

use crate::error::{Error, Result};
use crate::model::autoencoder::Autoencoder;

/// Converts pixel images in [0, 1] to scaled latents and back.
pub struct LatentCodec<B: Backend, A: Autoencoder<B>> {
    autoencoder: A,
    latent_scale: f64,
    latent_channels: usize,
    downsample_factor: usize,
    _backend: PhantomData<B>,
}

impl<B: Backend, A: Autoencoder<B>> LatentCodec<B, A> {
    pub fn new(
        autoencoder: A,
        latent_scale: f64,
        latent_channels: usize,
        downsample_factor: usize,
    ) -> Self {
        Self {
            autoencoder,
            latent_scale,
            latent_channels,
            downsample_factor,
            _backend: PhantomData,
        }
    }

    pub fn latent_channels(&self) -> usize {
        self.latent_channels
    }

    pub fn downsample_factor(&self) -> usize {
        self.downsample_factor
    }

    /// `[n, 3, h, w]` images in [0, 1] to `[n, c, h / 8, w / 8]` latents.
    ///
    /// Draws one sample from the posterior. Gradients flow back to `images`.
    pub fn encode_images(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let [n_batch, n_channel, height, width] = images.dims();
        if n_channel != 3 {
            return Err(Error::shape_mismatch(format!(
                "images must have 3 channels, got {}",
                n_channel
            )));
        }

        let images = images * 2.0 - 1.0;
        let posterior = self.autoencoder.encode(images);
        let latents = posterior.sample() * self.latent_scale;

        let expected = [
            n_batch,
            self.latent_channels,
            height / self.downsample_factor,
            width / self.downsample_factor,
        ];
        if latents.dims() != expected {
            return Err(Error::shape_mismatch(format!(
                "autoencoder produced latents {:?}, expected {:?}",
                latents.dims(),
                expected
            )));
        }

        Ok(latents)
    }

    /// `[n, c, h, w]` latents to `[n, 3, h * 8, w * 8]` images clamped to [0, 1].
    pub fn decode_latents(&self, latents: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let [n_batch, n_channel, height, width] = latents.dims();
        if n_channel != self.latent_channels {
            return Err(Error::shape_mismatch(format!(
                "latents must have {} channels, got {}",
                self.latent_channels, n_channel
            )));
        }

        let images = self.autoencoder.decode(latents * (1.0 / self.latent_scale));
        let images = (images / 2.0 + 0.5).clamp(0.0, 1.0);

        let expected = [
            n_batch,
            3,
            height * self.downsample_factor,
            width * self.downsample_factor,
        ];
        if images.dims() != expected {
            return Err(Error::shape_mismatch(format!(
                "autoencoder produced images {:?}, expected {:?}",
                images.dims(),
                expected
            )));
        }

        Ok(images)
    }

    /// Unbatched [`Self::encode_images`]: `[3, h, w]` to `[c, h / 8, w / 8]`.
    pub fn encode_image(&self, image: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        Ok(self.encode_images(image.unsqueeze())?.squeeze(0))
    }

    /// Unbatched [`Self::decode_latents`]: `[c, h, w]` to `[3, h * 8, w * 8]`.
    pub fn decode_latent(&self, latent: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        Ok(self.decode_latents(latent.unsqueeze())?.squeeze(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::resample::apply_separable;
    use crate::model::testing::{block_upsample, codec, TestBackend};
    use burn::tensor::Distribution;

    #[test]
    fn round_trip_approximately_reconstructs() {
        let device = Default::default();
        let codec = codec::<TestBackend>();

        // Constant 8x8 blocks survive the mock autoencoder's pooling exactly.
        let blocks = Tensor::<TestBackend, 4>::random([2, 3, 4, 4], Distribution::Default, &device);
        let images = apply_separable(
            blocks,
            block_upsample(32, &device),
            block_upsample(32, &device),
        );

        let latents = codec.encode_images(images.clone()).unwrap();
        let decoded = codec.decode_latents(latents).unwrap();

        assert_eq!(decoded.dims(), [2, 3, 32, 32]);
        let error: f32 = (decoded - images).abs().max().into_scalar();
        assert!(error < 1e-3, "reconstruction error {}", error);
    }

    #[test]
    fn shapes_are_preserved_across_round_trips() {
        let device = Default::default();
        let codec = codec::<TestBackend>();

        let images = Tensor::<TestBackend, 4>::random([1, 3, 64, 48], Distribution::Default, &device);
        let latents = codec.encode_images(images).unwrap();
        assert_eq!(latents.dims(), [1, 4, 8, 6]);

        let decoded = codec.decode_latents(latents).unwrap();
        assert_eq!(decoded.dims(), [1, 3, 64, 48]);

        let latents = codec.encode_images(decoded).unwrap();
        assert_eq!(latents.dims(), [1, 4, 8, 6]);
    }

    #[test]
    fn decoded_pixels_are_clamped() {
        let device = Default::default();
        let codec = codec::<TestBackend>();

        let latents = Tensor::<TestBackend, 4>::random([1, 4, 4, 4], Distribution::Normal(0.0, 10.0), &device);
        let images = codec.decode_latents(latents).unwrap();

        let min: f32 = images.clone().min().into_scalar();
        let max: f32 = images.max().into_scalar();
        assert!(min >= 0.0 && max <= 1.0);
    }

    #[test]
    fn single_image_variants_drop_the_batch_axis() {
        let device = Default::default();
        let codec = codec::<TestBackend>();

        let image = Tensor::<TestBackend, 3>::ones([3, 16, 16], &device) * 0.25;
        let latent = codec.encode_image(image).unwrap();
        assert_eq!(latent.dims(), [4, 2, 2]);

        let decoded = codec.decode_latent(latent).unwrap();
        assert_eq!(decoded.dims(), [3, 16, 16]);
    }

    #[test]
    fn wrong_channel_counts_are_rejected() {
        let device = Default::default();
        let codec = codec::<TestBackend>();

        let images = Tensor::<TestBackend, 4>::zeros([1, 4, 16, 16], &device);
        assert!(matches!(codec.encode_images(images), Err(Error::ShapeMismatch(_))));

        let latents = Tensor::<TestBackend, 4>::zeros([1, 3, 2, 2], &device);
        assert!(matches!(codec.decode_latents(latents), Err(Error::ShapeMismatch(_))));
    }
}
