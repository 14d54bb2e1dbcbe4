use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while building or running a layer chain.
///
/// Numerical trouble (NaN, overflow) is not represented here; it propagates
/// through the weights exactly as the math dictates.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("{layer}: expected per-sample width {expected}, received {found}")]
    Width {
        layer: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{layer}: backward received {found} samples but the last forward saw {expected}")]
    BatchSize {
        layer: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{layer}: backward called without a preceding forward")]
    NotReady { layer: &'static str },
    #[error("{layer}: index {index} is out of range for {limit} entries")]
    InvalidIndex {
        layer: &'static str,
        index: f64,
        limit: usize,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Missing field '{0}'")]
    MissingField(&'static str),
    #[error("Training data is empty")]
    EmptyData,
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
