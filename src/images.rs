use std::path::Path;

use burn::tensor::{backend::Backend, Data, Shape, Tensor};
use image::{io::Reader as ImageReader, ColorType::Rgb8, RgbImage};
use num_traits::ToPrimitive;

use crate::error::{Error, Result};

/// Same-sized RGB images as interleaved `u8` buffers, one per image.
#[derive(Debug, Clone, PartialEq)]
pub struct RawImages {
    pub buffer: Vec<Vec<u8>>,
    pub width: usize,
    pub height: usize,
}

impl RawImages {
    /// Quantizes `[n, height, width, 3]` pixels in [0, 1].
    pub fn from_tensor<B: Backend>(images: Tensor<B, 4>) -> Result<Self> {
        let [n_batch, height, width, n_channel] = images.dims();
        if n_channel != 3 {
            return Err(Error::shape_mismatch(format!(
                "expected RGB pixels in the last axis, got {} channels",
                n_channel
            )));
        }

        let num_elements_per_image = height * width * n_channel;
        let flattened: Vec<u8> = images
            .mul_scalar(255.0)
            .into_data()
            .value
            .into_iter()
            .map(|v| v.to_f64().map_or(0, |v| v.round().clamp(0.0, 255.0) as u8))
            .collect();

        let buffer = flattened
            .chunks(num_elements_per_image.max(1))
            .take(n_batch)
            .map(|chunk| chunk.to_vec())
            .collect();

        Ok(Self { buffer, width, height })
    }

    /// `[n, 3, height, width]` pixels in [0, 1], the layout the codec encodes.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let n_batch = self.buffer.len();
        let values: Vec<f32> = self
            .buffer
            .iter()
            .flatten()
            .map(|&v| v as f32 / 255.0)
            .collect();

        let data = Data::new(values, Shape::new([n_batch, self.height, self.width, 3]));
        Tensor::<B, 4>::from_data(data.convert::<B::FloatElem>(), device)
            .swap_dims(2, 3)
            .swap_dims(1, 2)
    }

    /// Reads image files, which must all share one size.
    pub fn load<P: AsRef<Path>>(filenames: &[P]) -> Result<Self> {
        let images = filenames
            .iter()
            .map(|filename| Ok(ImageReader::open(filename)?.decode()?.to_rgb8()))
            .collect::<Result<Vec<RgbImage>>>()?;

        let (width, height) = images
            .first()
            .map(|img| img.dimensions())
            .ok_or_else(|| Error::invalid_input("no images to load"))?;

        if !images.iter().all(|img| img.dimensions() == (width, height)) {
            return Err(Error::shape_mismatch("images have different dimensions"));
        }

        Ok(Self {
            buffer: images.into_iter().map(|image| image.into_vec()).collect(),
            width: width as usize,
            height: height as usize,
        })
    }

    /// Writes `<basepath><index>.png` for every image.
    pub fn save(&self, basepath: &str) -> Result<()> {
        for (index, img_data) in self.buffer.iter().enumerate() {
            let path = format!("{}{}.png", basepath, index);
            image::save_buffer(path, &img_data[..], self.width as u32, self.height as u32, Rgb8)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn quantizes_and_splits_per_image() {
        let device = Default::default();
        let pixels = Tensor::<TestBackend, 4>::from_data(
            Data::from([[[[0.0, 0.5, 1.0]]], [[[1.2, -0.1, 0.25]]]]),
            &device,
        );

        let images = RawImages::from_tensor(pixels).unwrap();
        assert_eq!((images.width, images.height), (1, 1));
        assert_eq!(images.buffer, vec![vec![0, 128, 255], vec![255, 0, 64]]);
    }

    #[test]
    fn rejects_channel_first_pixels() {
        let device = Default::default();
        let pixels = Tensor::<TestBackend, 4>::zeros([1, 3, 4, 4], &device);

        assert!(matches!(RawImages::from_tensor(pixels), Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn saved_images_load_back_as_channel_first_tensors() {
        let dir = std::env::temp_dir().join("diffusionprior-images");
        std::fs::create_dir_all(&dir).unwrap();
        let basepath = format!("{}/red", dir.to_str().unwrap());

        let width = 4;
        let height = 2;
        let red: Vec<u8> = (0..width * height).flat_map(|_| [255, 0, 0]).collect();
        let images = RawImages { buffer: vec![red], width, height };
        images.save(&basepath).unwrap();

        let loaded = RawImages::load(&[format!("{}0.png", basepath)]).unwrap();
        assert_eq!(loaded, images);

        let device = Default::default();
        let tensor = loaded.to_tensor::<TestBackend>(&device);
        assert_eq!(tensor.dims(), [1, 3, 2, 4]);

        let red_channel: f32 = tensor.clone().slice([0..1, 0..1]).mean().into_scalar();
        let green_channel: f32 = tensor.slice([0..1, 1..2]).mean().into_scalar();
        assert!((red_channel - 1.0).abs() < 1e-6);
        assert!(green_channel.abs() < 1e-6);
    }

    #[test]
    fn loading_nothing_is_invalid() {
        let filenames: [&str; 0] = [];
        assert!(matches!(RawImages::load(&filenames), Err(Error::InvalidInput(_))));
    }
}
