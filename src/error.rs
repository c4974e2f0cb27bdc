//! Error types for seq-prob.

use thiserror::Error;

/// Result type alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for estimator runs.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid run parameters, detected before any oracle call.
    #[error("invalid `{param}`: {reason}")]
    Config { param: &'static str, reason: String },

    /// Tensor backend or oracle failure, propagated unchanged.
    ///
    /// Numerical invariant violations inside one history's search never
    /// surface here: they are captured into that history's status flag.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl Error {
    pub(crate) fn config(param: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            param,
            reason: reason.into(),
        }
    }
}
