//! Monte-Carlo estimators: importance sampling and the uniform proposal.
//!
//! Importance sampling draws continuations weighted by the oracle's own
//! distribution — the stochastic collaborator to the beam search's
//! deterministic lower bound. The uniform variant fixes the proposal to
//! uniform-over-legal-vocabulary, trading variance for model independence
//! (and needing no oracle at all).

use candle_core::Tensor;
use indicatif::ProgressBar;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::oracle::NextTokenOracle;
use crate::search::frontier::Frontier;
use crate::search::{
    check_distribution, excluded_mask, generation_lengths, probs_to_rows, stabilize_row,
    validate_seed, validate_temperature, SearchStatus,
};

/// Sampler run parameters.
#[derive(Debug, Clone)]
pub struct SampleConfig {
    /// Continuations drawn per history.
    pub num_seqs: usize,
    /// Temperature forwarded to the oracle.
    pub temperature: f64,
    /// Token ids that may never be emitted.
    pub excluded: Vec<u32>,
    /// Additive stabilizer applied before each renormalization.
    pub eps: f64,
    /// Seed for the caller-owned random source; `None` draws from entropy.
    pub seed: Option<u64>,
    /// Show a progress bar over generation steps.
    pub progress: bool,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            num_seqs: 1000,
            temperature: 1.0,
            excluded: Vec::new(),
            eps: 1e-10,
            seed: None,
            progress: false,
        }
    }
}

/// Sampled continuations and their log-probabilities for one history.
#[derive(Debug, Clone, Serialize)]
pub struct SampleResult {
    /// `num_seqs` sampled sequences (history prefix included).
    pub sequences: Vec<Vec<u32>>,
    /// Cumulative log-probability of each row under the proposal.
    pub log_probs: Vec<f64>,
    /// Whether sampling ran to the target length.
    pub status: SearchStatus,
}

impl SampleResult {
    /// Mean of per-row probabilities: the Monte-Carlo estimate of the
    /// completion probability.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_probability(&self) -> f64 {
        if self.log_probs.is_empty() {
            return 0.0;
        }
        let total: f64 = self.log_probs.iter().map(|lp| lp.exp()).sum();
        total / self.log_probs.len() as f64
    }

    /// Running estimates over the first `k` rows for each requested `k`,
    /// so variance-over-sample-count curves come from a single run.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sub_estimates(&self, counts: &[usize]) -> Vec<f64> {
        counts
            .iter()
            .map(|&k| {
                let k = k.min(self.log_probs.len());
                if k == 0 {
                    return 0.0;
                }
                let total: f64 = self.log_probs[..k].iter().map(|lp| lp.exp()).sum();
                total / k as f64
            })
            .collect()
    }
}

struct SampleRun {
    frontier: Option<Frontier>,
    status: SearchStatus,
}

impl SampleRun {
    fn into_result(self) -> SampleResult {
        let (sequences, log_probs) = match self.frontier {
            Some(frontier) => frontier.into_parts(),
            None => (Vec::new(), Vec::new()),
        };
        SampleResult {
            sequences,
            log_probs,
            status: self.status,
        }
    }
}

/// Draw `num_seqs` model-weighted continuations per history.
///
/// The frontier width stays at `num_seqs` for the whole search — no pruning,
/// one oracle query per active history per step. Rows of a finished history
/// are held in place while other histories continue. Numeric degeneracies
/// abort only the affected history; oracle errors fail the whole call.
///
/// # Errors
/// Returns a configuration error before any oracle call for malformed
/// parameters, or a tensor error propagated from the oracle.
#[allow(clippy::cast_possible_truncation)]
pub fn importance_sample<O: NextTokenOracle>(
    oracle: &O,
    histories: &[Vec<u32>],
    total_seq_lens: &[usize],
    config: &SampleConfig,
) -> Result<Vec<SampleResult>> {
    let gen_lens = generation_lengths(histories, total_seq_lens)?;
    validate_temperature(config.temperature)?;
    validate_seed(config.seed)?;
    if config.num_seqs == 0 {
        return Err(Error::config("num_seqs", "at least one sample is required"));
    }
    let vocab = oracle.vocab_size();
    let mask = excluded_mask(&config.excluded, vocab)?;
    let mut rng = seeded_rng(config.seed);

    // Root: one single-row query per history, then num_seqs independent
    // multinomial draws from its masked distribution.
    let mut runs = Vec::with_capacity(histories.len());
    for history in histories {
        let tokens = Tensor::new(vec![history.clone()], oracle.device())?;
        let (probs, state) = oracle.next(&tokens, None, config.temperature)?;
        let mut rows = probs_to_rows(&probs, 1, vocab)?;
        let mut row = rows.pop().ok_or_else(|| {
            candle_core::Error::Msg("oracle returned an empty probability batch".to_string())
        })?;
        stabilize_row(&mut row, &mask, config.eps);

        if let Err(reason) = check_distribution(&row) {
            runs.push(SampleRun {
                frontier: None,
                status: SearchStatus::Aborted { step: 0, reason },
            });
            continue;
        }

        let mut drawn = Vec::with_capacity(config.num_seqs);
        let mut log_probs = Vec::with_capacity(config.num_seqs);
        for _ in 0..config.num_seqs {
            let token = sample_multinomial(&row, &mut rng);
            drawn.push(token as u32);
            log_probs.push(row[token].ln());
        }
        runs.push(SampleRun {
            frontier: Some(Frontier::seed(history, &drawn, log_probs, &state)?),
            status: SearchStatus::Complete,
        });
    }

    let max_gen = gen_lens.iter().copied().max().unwrap_or(0);
    let bar = if config.progress {
        ProgressBar::new(max_gen as u64)
    } else {
        ProgressBar::hidden()
    };
    bar.inc(1);

    let identity: Vec<u32> = (0..config.num_seqs as u32).collect();
    for pos in 1..max_gen {
        for (i, run) in runs.iter_mut().enumerate() {
            if pos >= gen_lens[i] || !run.status.is_complete() {
                continue;
            }
            let Some(frontier) = run.frontier.as_mut() else {
                continue;
            };

            let last: Vec<Vec<u32>> = frontier.last_tokens().iter().map(|&t| vec![t]).collect();
            let tokens = Tensor::new(last, oracle.device())?;
            let (probs, state) = oracle.next(&tokens, Some(frontier.state()), config.temperature)?;
            let mut rows = probs_to_rows(&probs, config.num_seqs, vocab)?;

            let mut emitted = Vec::with_capacity(config.num_seqs);
            let mut log_probs = Vec::with_capacity(config.num_seqs);
            let mut failure = None;
            for (r, row) in rows.iter_mut().enumerate() {
                stabilize_row(row, &mask, config.eps);
                if let Err(reason) = check_distribution(row) {
                    failure = Some(reason);
                    break;
                }
                let token = sample_multinomial(row, &mut rng);
                emitted.push(token as u32);
                log_probs.push(frontier.log_probs()[r] + row[token].ln());
            }
            if let Some(reason) = failure {
                run.status = SearchStatus::Aborted { step: pos, reason };
                continue;
            }
            frontier.advance(&identity, &emitted, log_probs, &state)?;
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    Ok(runs.into_iter().map(SampleRun::into_result).collect())
}

/// Draw `num_seqs` continuations per history uniformly over the legal
/// vocabulary. Issues no oracle calls; each row's log-probability is
/// `gen_len * ln(1 / legal)`.
///
/// # Errors
/// Returns a configuration error for malformed parameters.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn uniform_sample(
    histories: &[Vec<u32>],
    vocab_size: usize,
    total_seq_lens: &[usize],
    config: &SampleConfig,
) -> Result<Vec<SampleResult>> {
    let gen_lens = generation_lengths(histories, total_seq_lens)?;
    validate_seed(config.seed)?;
    if config.num_seqs == 0 {
        return Err(Error::config("num_seqs", "at least one sample is required"));
    }
    let mask = excluded_mask(&config.excluded, vocab_size)?;
    let legal: Vec<u32> = (0..vocab_size as u32)
        .filter(|&t| !mask[t as usize])
        .collect();
    let mut rng = seeded_rng(config.seed);

    let mut results = Vec::with_capacity(histories.len());
    for (history, &gen_len) in histories.iter().zip(&gen_lens) {
        let row_log_prob = gen_len as f64 * (1.0 / legal.len() as f64).ln();
        let mut sequences = Vec::with_capacity(config.num_seqs);
        for _ in 0..config.num_seqs {
            let mut seq = history.clone();
            for _ in 0..gen_len {
                seq.push(legal[rng.gen_range(0..legal.len())]);
            }
            sequences.push(seq);
        }
        results.push(SampleResult {
            sequences,
            log_probs: vec![row_log_prob; config.num_seqs],
            status: SearchStatus::Complete,
        });
    }
    Ok(results)
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Sample an index from a normalized distribution.
#[allow(clippy::cast_possible_truncation)]
fn sample_multinomial(probs: &[f64], rng: &mut impl Rng) -> usize {
    let r: f64 = rng.gen();
    let mut cumulative = 0.0;
    for (idx, &p) in probs.iter().enumerate() {
        cumulative += p;
        if r < cumulative {
            return idx;
        }
    }
    // Numerical edge case: return last non-zero prob, else 0.
    probs.iter().rposition(|&p| p > 0.0).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multinomial_peaked_distribution_is_deterministic() {
        let probs = vec![0.0, 1.0, 0.0];
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..20 {
            assert_eq!(sample_multinomial(&probs, &mut rng), 1);
        }
    }

    #[test]
    fn test_multinomial_covers_the_support() {
        let probs = vec![0.25; 4];
        let mut rng = StdRng::seed_from_u64(7);
        let drawn: std::collections::HashSet<usize> =
            (0..200).map(|_| sample_multinomial(&probs, &mut rng)).collect();
        assert_eq!(drawn.len(), 4, "uniform draws should hit every index");
    }

    #[test]
    fn test_mean_probability_averages_exponentiated_rows() {
        let result = SampleResult {
            sequences: vec![vec![1], vec![2]],
            log_probs: vec![0.5f64.ln(), 0.25f64.ln()],
            status: SearchStatus::Complete,
        };
        assert!((result.mean_probability() - 0.375).abs() < 1e-12);
    }

    #[test]
    fn test_sub_estimates_clamp_to_available_rows() {
        let result = SampleResult {
            sequences: vec![vec![1], vec![2]],
            log_probs: vec![0.5f64.ln(), 0.25f64.ln()],
            status: SearchStatus::Complete,
        };
        let subs = result.sub_estimates(&[1, 2, 100]);
        assert!((subs[0] - 0.5).abs() < 1e-12);
        assert!((subs[1] - 0.375).abs() < 1e-12);
        assert!((subs[2] - 0.375).abs() < 1e-12);
    }

    #[test]
    fn test_uniform_sample_log_probs_and_legality() {
        let config = SampleConfig {
            num_seqs: 16,
            excluded: vec![0, 3],
            seed: Some(11),
            ..SampleConfig::default()
        };
        let results = uniform_sample(&[vec![1u32]], 5, &[4], &config).unwrap();
        let result = &results[0];

        let expected = 3.0 * (1.0f64 / 3.0).ln();
        for (seq, lp) in result.sequences.iter().zip(&result.log_probs) {
            assert_eq!(seq.len(), 4);
            assert!((lp - expected).abs() < 1e-12);
            for &t in &seq[1..] {
                assert!(t == 1 || t == 2 || t == 4, "illegal token {t}");
            }
        }
    }

    #[test]
    fn test_uniform_sample_is_seed_deterministic() {
        let config = SampleConfig {
            num_seqs: 8,
            seed: Some(5),
            ..SampleConfig::default()
        };
        let a = uniform_sample(&[vec![2u32, 2]], 6, &[5], &config).unwrap();
        let b = uniform_sample(&[vec![2u32, 2]], 6, &[5], &config).unwrap();
        assert_eq!(a[0].sequences, b[0].sequences);
    }
}
