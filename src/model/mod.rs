pub mod stablediffusion;

pub mod autoencoder;
pub mod clip;
pub mod unet;

pub mod resample;
pub mod scheduler;

pub mod load;

#[cfg(test)]
pub(crate) mod testing;
