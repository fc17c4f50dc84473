pub mod backend;
pub mod error;
pub mod images;
pub mod model;
pub mod token;

pub use error::{Error, Result};
