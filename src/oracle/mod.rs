//! The next-token oracle boundary.
//!
//! The search engines only ever see a model through [`NextTokenOracle`]: one
//! batched query returning per-row next-token probabilities and an updated
//! opaque state. Everything else about the model (architecture, weights,
//! checkpoints) lives on the far side of this trait.

pub mod demo;
pub mod state;

use candle_core::{Device, Result, Tensor};

pub use demo::DemoOracle;
pub use state::{ModelState, RowView, StateKind};

/// Batched next-token probability oracle.
///
/// `tokens` is `(batch, n)` u32 on [`NextTokenOracle::device`]: the full
/// history (`n = hist_len`) for the root query of a search, the last emitted
/// token (`n = 1`) on every later step. The returned probabilities are
/// `(batch, vocab_size)` f32, non-negative but not necessarily normalized;
/// the returned state carries one row per input row, at the same row index.
///
/// Implementations must be deterministic given identical inputs and device,
/// and must accept any batch size from 1 up to the largest frontier width
/// requested.
pub trait NextTokenOracle {
    /// Number of legal token identifiers.
    fn vocab_size(&self) -> usize;

    /// Device the oracle expects its input tensors on.
    fn device(&self) -> &Device;

    /// Structural capability of the opaque state this oracle produces.
    fn state_kind(&self) -> StateKind;

    /// Advance every row by one token.
    ///
    /// # Errors
    /// Returns an error on shape mismatches or backend failure. The engines
    /// propagate it unchanged: the state cannot be rewound, so there is no
    /// safe retry at this layer.
    fn next(
        &self,
        tokens: &Tensor,
        state: Option<&ModelState>,
        temperature: f64,
    ) -> Result<(Tensor, ModelState)>;
}
