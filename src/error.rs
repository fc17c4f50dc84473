use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied value violates a documented precondition.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A tensor's dimensions disagree with a component's contract.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("config: {0}")]
    Config(String),

    #[error("tokenizer: {0}")]
    Tokenizer(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    pub(crate) fn invalid_input(msg: impl fmt::Display) -> Self {
        Error::InvalidInput(msg.to_string())
    }

    pub(crate) fn shape_mismatch(msg: impl fmt::Display) -> Self {
        Error::ShapeMismatch(msg.to_string())
    }
}

impl From<burn::config::ConfigError> for Error {
    fn from(err: burn::config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
