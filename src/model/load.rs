use std::fs::File;
use std::io::{self, Read};

use burn::tensor::{backend::Backend, Data, Shape, Tensor};
use npy::NpyData;

use crate::error::Result;

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

pub fn load_npy(name: &str, path: &str) -> Result<Vec<f32>> {
    let tensor_path = format!("{}/{}.npy", path, name);

    let mut buf = vec![];
    File::open(&tensor_path)?.read_to_end(&mut buf)?;

    let numpy_data: NpyData<f32> = NpyData::from_bytes(&buf)?;
    Ok(numpy_data.to_vec())
}

/// Loads a tensor dumped as a flat f32 array whose first `D` entries are the dims.
pub fn load_tensor<B: Backend, const D: usize>(
    name: &str,
    path: &str,
    device: &B::Device,
) -> Result<Tensor<B, D>> {
    let values = load_npy(name, path)?;
    if values.len() < D {
        return Err(invalid_data(format!("{} holds no shape header", name)).into());
    }

    let mut dims = [0; D];
    for (dim, &v) in dims.iter_mut().zip(&values[..D]) {
        *dim = v as usize;
    }

    let data = values[D..].to_vec();
    let n_elements: usize = dims.iter().product();
    if data.len() != n_elements {
        return Err(invalid_data(format!(
            "{} has {} values but shape {:?}",
            name,
            data.len(),
            dims
        ))
        .into());
    }

    let data = Data::new(data, Shape::new(dims));
    Ok(Tensor::from_data(data.convert::<B::FloatElem>(), device))
}

/// Loads a one-dimensional dump (length header followed by the values).
pub fn load_values(name: &str, path: &str) -> Result<Vec<f64>> {
    let values = load_npy(name, path)?;
    match values.split_first() {
        Some((&len, rest)) if len >= 0.0 && len as usize == rest.len() => {
            Ok(rest.iter().map(|&v| v as f64).collect())
        }
        _ => Err(invalid_data(format!("{} is not a one-dimensional dump", name)).into()),
    }
}

pub fn load_usize(name: &str, path: &str) -> Result<usize> {
    let values = load_npy(name, path)?;
    match values[..] {
        [value] if value >= 0.0 => Ok(value as usize),
        _ => Err(invalid_data(format!("{} is not a single non-negative value", name)).into()),
    }
}
