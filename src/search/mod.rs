//! Sequence-search and sampling engines.
//!
//! `beam` holds the adaptive-width beam search (a deterministic lower bound
//! on completion mass), `importance` the Monte-Carlo estimators, `coverage`
//! the pruning policies, and `frontier` the candidate aggregate both engines
//! drive.

pub mod beam;
pub mod coverage;
pub mod frontier;
pub mod importance;

use candle_core::Tensor;
use serde::Serialize;

pub use beam::{beam_search, BeamResult, BeamSearchConfig};
pub use coverage::{min_variance_split, CoverageKind, CoverageSchedule, CoverageTarget};
pub use frontier::Frontier;
pub use importance::{importance_sample, uniform_sample, SampleConfig, SampleResult};

use crate::error::{Error, Result};

/// Terminal condition of one history's search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    /// Every row reached the target length.
    Complete,
    /// The search stopped early; the result holds the last valid frontier.
    Aborted { step: usize, reason: String },
}

impl SearchStatus {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Per-history generation lengths derived from a broadcastable target list.
///
/// Fails fast on empty inputs, a length-list/history mismatch, or a target
/// that leaves no tokens to generate.
pub(crate) fn generation_lengths(
    histories: &[Vec<u32>],
    total_seq_lens: &[usize],
) -> Result<Vec<usize>> {
    if histories.is_empty() {
        return Err(Error::config("histories", "at least one history is required"));
    }
    for (i, history) in histories.iter().enumerate() {
        if history.is_empty() {
            return Err(Error::config("histories", format!("history {i} is empty")));
        }
    }

    let targets: Vec<usize> = match total_seq_lens.len() {
        1 => vec![total_seq_lens[0]; histories.len()],
        n if n == histories.len() => total_seq_lens.to_vec(),
        n => {
            return Err(Error::config(
                "total_seq_lens",
                format!("{n} target lengths for {} histories", histories.len()),
            ))
        }
    };

    let mut gen_lens = Vec::with_capacity(histories.len());
    for (i, (history, &target)) in histories.iter().zip(&targets).enumerate() {
        if target <= history.len() {
            return Err(Error::config(
                "total_seq_lens",
                format!(
                    "target length {target} for history {i} leaves nothing to generate \
                     (history length {})",
                    history.len()
                ),
            ));
        }
        gen_lens.push(target - history.len());
    }
    Ok(gen_lens)
}

pub(crate) fn validate_temperature(temperature: f64) -> Result<()> {
    if temperature.is_finite() && temperature > 0.0 {
        Ok(())
    } else {
        Err(Error::config(
            "temperature",
            format!("must be a positive real, got {temperature}"),
        ))
    }
}

pub(crate) fn validate_seed(seed: Option<u64>) -> Result<()> {
    if seed == Some(0) {
        return Err(Error::config("seed", "0 is reserved; pick a non-zero seed"));
    }
    Ok(())
}

/// Boolean mask over the vocabulary, true at excluded ids.
pub(crate) fn excluded_mask(excluded: &[u32], vocab_size: usize) -> Result<Vec<bool>> {
    let mut mask = vec![false; vocab_size];
    for &token in excluded {
        let Some(slot) = mask.get_mut(token as usize) else {
            return Err(Error::config(
                "excluded",
                format!("token id {token} is outside the vocabulary of {vocab_size}"),
            ));
        };
        *slot = true;
    }
    if mask.iter().all(|&m| m) {
        return Err(Error::config("excluded", "excludes the entire vocabulary"));
    }
    Ok(mask)
}

/// Stabilize, mask, and renormalize one distribution row in place.
///
/// Adds `eps` everywhere, knocks excluded entries down to `eps / 2`, then
/// renormalizes to sum to 1. Applied on every step, not just at the root, so
/// excluded ids can never accumulate mass.
pub(crate) fn stabilize_row(row: &mut [f64], mask: &[bool], eps: f64) {
    for p in row.iter_mut() {
        *p += eps;
    }
    for (p, &out) in row.iter_mut().zip(mask) {
        if out {
            *p = eps * 0.5;
        }
    }
    let sum: f64 = row.iter().sum();
    for p in row.iter_mut() {
        *p /= sum;
    }
}

/// Check that a renormalized row is a usable distribution.
pub(crate) fn check_distribution(row: &[f64]) -> std::result::Result<(), String> {
    for (token, &p) in row.iter().enumerate() {
        if p.is_nan() {
            return Err(format!("NaN probability for token {token}"));
        }
        if p < 0.0 {
            return Err(format!("negative mass {p} for token {token}"));
        }
    }
    Ok(())
}

/// Pull an oracle probability tensor into f64 rows, checking its shape.
pub(crate) fn probs_to_rows(
    probs: &Tensor,
    batch: usize,
    vocab_size: usize,
) -> Result<Vec<Vec<f64>>> {
    let rows = probs.to_vec2::<f32>().map_err(Error::Tensor)?;
    if rows.len() != batch || rows.iter().any(|row| row.len() != vocab_size) {
        return Err(Error::Tensor(candle_core::Error::Msg(format!(
            "oracle returned a {}x{} probability tensor for a {batch}x{vocab_size} query",
            rows.len(),
            rows.first().map_or(0, Vec::len),
        ))));
    }
    Ok(rows
        .into_iter()
        .map(|row| row.into_iter().map(f64::from).collect())
        .collect())
}
