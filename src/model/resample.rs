//! Separable resampling expressed as matrix products, so gradients flow
//! through it on every backend.

use burn::tensor::{backend::Backend, Data, Shape, Tensor};

use crate::error::{Error, Result};

/// Row-major `[out_size, in_size]` weights for bilinear interpolation with
/// `align_corners = false`. Source coordinates left of the first sample are
/// clamped to it.
pub fn bilinear_weights(in_size: usize, out_size: usize) -> Vec<f32> {
    let scale = in_size as f64 / out_size as f64;
    let mut weights = vec![0.0f32; out_size * in_size];

    for o in 0..out_size {
        let src = ((o as f64 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(in_size - 1);
        let i1 = (i0 + 1).min(in_size - 1);
        let lambda = src - i0 as f64;

        weights[o * in_size + i0] += (1.0 - lambda) as f32;
        weights[o * in_size + i1] += lambda as f32;
    }

    weights
}

pub fn weight_matrix<B: Backend>(
    weights: Vec<f32>,
    out_size: usize,
    in_size: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let data = Data::new(weights, Shape::new([out_size, in_size]));
    Tensor::from_data(data.convert::<B::FloatElem>(), device)
}

/// Computes `rows · x · colsᵀ` for every image and channel of `x`.
///
/// `rows` is `[h_out, h]` and `cols` is `[w_out, w]`.
pub fn apply_separable<B: Backend>(
    x: Tensor<B, 4>,
    rows: Tensor<B, 2>,
    cols: Tensor<B, 2>,
) -> Tensor<B, 4> {
    let [n_batch, n_channel, _, _] = x.dims();

    let rows = rows.unsqueeze::<4>().repeat(0, n_batch).repeat(1, n_channel);
    let cols = cols
        .transpose()
        .unsqueeze::<4>()
        .repeat(0, n_batch)
        .repeat(1, n_channel);

    rows.matmul(x).matmul(cols)
}

/// Bilinearly resizes `[n, c, h, w]` images to `[n, c, height, width]`.
pub fn resize_bilinear<B: Backend>(x: Tensor<B, 4>, [height, width]: [usize; 2]) -> Result<Tensor<B, 4>> {
    let [_, _, h, w] = x.dims();
    if h == 0 || w == 0 || height == 0 || width == 0 {
        return Err(Error::shape_mismatch(format!(
            "cannot resize {}x{} images to {}x{}",
            h, w, height, width
        )));
    }
    if [h, w] == [height, width] {
        return Ok(x);
    }

    let device = x.device();
    let rows = weight_matrix::<B>(bilinear_weights(h, height), height, h, &device);
    let cols = weight_matrix::<B>(bilinear_weights(w, width), width, w, &device);

    Ok(apply_separable(x, rows, cols))
}
