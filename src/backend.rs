//! Compile-time backend selection.
//!
//! The `tch` feature runs on libtorch (CUDA when available), otherwise the
//! CPU `ndarray` backend is used.

use burn_autodiff::Autodiff;

cfg_if::cfg_if! {
    if #[cfg(feature = "tch")] {
        pub use burn_tch::{LibTorch, LibTorchDevice};

        pub type DefaultBackend = LibTorch<f32>;

        pub fn default_device() -> LibTorchDevice {
            if tch::Cuda::is_available() {
                LibTorchDevice::Cuda(0)
            } else {
                LibTorchDevice::Cpu
            }
        }
    } else if #[cfg(feature = "ndarray")] {
        pub use burn_ndarray::{NdArray, NdArrayDevice};

        pub type DefaultBackend = NdArray<f32>;

        pub fn default_device() -> NdArrayDevice {
            NdArrayDevice::default()
        }
    }
}

#[cfg(any(feature = "tch", feature = "ndarray"))]
pub type DefaultAutodiffBackend = Autodiff<DefaultBackend>;
