//! Adaptive-width beam search over a next-token oracle.
//!
//! Tracks exact cumulative log-probabilities over an evolving frontier of
//! candidate continuations. The sum of the final frontier's probabilities is
//! a lower bound on the true completion mass: pruned mass is dropped, never
//! redistributed.

use std::cmp::Ordering;

use candle_core::Tensor;
use indicatif::ProgressBar;
use serde::Serialize;

use crate::error::Result;
use crate::oracle::NextTokenOracle;
use crate::search::coverage::{width_from_mass, CoverageKind, CoverageSchedule, CoverageTarget};
use crate::search::frontier::Frontier;
use crate::search::{
    check_distribution, excluded_mask, generation_lengths, probs_to_rows, stabilize_row,
    validate_temperature, SearchStatus,
};

/// Beam search run parameters.
#[derive(Debug, Clone)]
pub struct BeamSearchConfig {
    /// Threshold-update rule between steps.
    pub kind: CoverageKind,
    /// One pruning target per history, or a single broadcast target.
    pub coverage: Vec<CoverageTarget>,
    /// Temperature forwarded to the oracle.
    pub temperature: f64,
    /// Token ids that may never be emitted.
    pub excluded: Vec<u32>,
    /// Additive stabilizer applied before each renormalization.
    pub eps: f64,
    /// Show a progress bar over generation steps.
    pub progress: bool,
}

impl Default for BeamSearchConfig {
    fn default() -> Self {
        Self {
            kind: CoverageKind::Backoff,
            coverage: vec![CoverageTarget::Mass(0.9)],
            temperature: 1.0,
            excluded: Vec::new(),
            eps: 1e-10,
            progress: false,
        }
    }
}

/// Final candidates and per-step records for one history.
#[derive(Debug, Clone, Serialize)]
pub struct BeamResult {
    /// Final candidate sequences (history prefix included), best first.
    pub sequences: Vec<Vec<u32>>,
    /// Exact cumulative log-probability of each sequence.
    pub log_probs: Vec<f64>,
    /// Frontier width after every generation step, root included.
    pub beam_widths: Vec<usize>,
    /// Coverage threshold trajectory (empty for absolute widths).
    pub coverages: Vec<f64>,
    /// Retained probability mass after every generation step.
    pub intermediate_lower_bounds: Vec<f64>,
    /// Whether the search ran to the target length.
    pub status: SearchStatus,
}

impl BeamResult {
    /// Sum of final candidate probabilities: the lower bound on the
    /// completion mass.
    #[must_use]
    pub fn lower_bound(&self) -> f64 {
        self.log_probs.iter().map(|lp| lp.exp()).sum()
    }
}

struct HistoryRun {
    frontier: Option<Frontier>,
    widths: Vec<usize>,
    coverages: Vec<f64>,
    bounds: Vec<f64>,
    status: SearchStatus,
}

impl HistoryRun {
    fn new() -> Self {
        Self {
            frontier: None,
            widths: Vec::new(),
            coverages: Vec::new(),
            bounds: Vec::new(),
            status: SearchStatus::Complete,
        }
    }

    fn into_result(self) -> BeamResult {
        let (sequences, log_probs) = match self.frontier {
            Some(frontier) => frontier.into_parts(),
            None => (Vec::new(), Vec::new()),
        };
        BeamResult {
            sequences,
            log_probs,
            beam_widths: self.widths,
            coverages: self.coverages,
            intermediate_lower_bounds: self.bounds,
            status: self.status,
        }
    }
}

/// Run the adaptive-width beam search for every history.
///
/// `total_seq_lens` is a single broadcast target length or one per history.
/// Histories reach `DONE` independently; a finished history's frontier is
/// frozen and its slot skipped, so results line up with the input order.
/// Numeric degeneracies abort only the affected history (its status turns
/// [`SearchStatus::Aborted`]); oracle errors fail the whole call.
///
/// # Errors
/// Returns a configuration error before any oracle call for malformed
/// parameters, or a tensor error propagated from the oracle.
pub fn beam_search<O: NextTokenOracle>(
    oracle: &O,
    histories: &[Vec<u32>],
    total_seq_lens: &[usize],
    config: &BeamSearchConfig,
) -> Result<Vec<BeamResult>> {
    let gen_lens = generation_lengths(histories, total_seq_lens)?;
    validate_temperature(config.temperature)?;
    let vocab = oracle.vocab_size();
    let mask = excluded_mask(&config.excluded, vocab)?;
    let mut schedule = CoverageSchedule::new(config.kind, &config.coverage, &gen_lens)?;

    let max_gen = gen_lens.iter().copied().max().unwrap_or(0);
    let bar = if config.progress {
        ProgressBar::new(max_gen as u64)
    } else {
        ProgressBar::hidden()
    };

    let mut runs = Vec::with_capacity(histories.len());
    for (i, history) in histories.iter().enumerate() {
        runs.push(seed_history(oracle, history, i, &mut schedule, &mask, config)?);
    }
    bar.inc(1);

    for pos in 1..max_gen {
        for (i, run) in runs.iter_mut().enumerate() {
            if pos >= gen_lens[i] || !run.status.is_complete() {
                continue;
            }
            advance_history(oracle, run, i, pos, &mut schedule, &mask, config)?;
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    Ok(runs.into_iter().map(HistoryRun::into_result).collect())
}

/// Root step: one single-row query, frontier seeded from the top tokens of
/// the unconditioned distribution.
#[allow(clippy::cast_possible_truncation)]
fn seed_history<O: NextTokenOracle>(
    oracle: &O,
    history: &[u32],
    i: usize,
    schedule: &mut CoverageSchedule,
    mask: &[bool],
    config: &BeamSearchConfig,
) -> Result<HistoryRun> {
    let vocab = oracle.vocab_size();
    let tokens = Tensor::new(vec![history.to_vec()], oracle.device())?;
    let (probs, state) = oracle.next(&tokens, None, config.temperature)?;
    let mut rows = probs_to_rows(&probs, 1, vocab)?;
    let mut row = rows.pop().ok_or_else(|| {
        candle_core::Error::Msg("oracle returned an empty probability batch".to_string())
    })?;

    stabilize_row(&mut row, mask, config.eps);
    let mut run = HistoryRun::new();
    if let Err(reason) = check_distribution(&row) {
        run.status = SearchStatus::Aborted { step: 0, reason };
        return Ok(run);
    }

    let mut order: Vec<usize> = (0..vocab).collect();
    order.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or(Ordering::Equal));
    let sorted_probs: Vec<f64> = order.iter().map(|&t| row[t]).collect();

    // Width saturation is not an error: a single query cannot seed more
    // unique candidates than the vocabulary holds.
    let width = schedule.width_for(i, &sorted_probs).min(vocab);
    run.widths.push(width);
    if let Some(threshold) = schedule.threshold(i) {
        // The root does not advance the threshold; the first combined step
        // still prunes at the root value.
        run.coverages.push(threshold);
    }

    let kept_tokens: Vec<u32> = order[..width].iter().map(|&t| t as u32).collect();
    let log_probs: Vec<f64> = sorted_probs[..width].iter().map(|p| p.ln()).collect();
    let frontier = Frontier::seed(history, &kept_tokens, log_probs, &state)?;
    run.bounds.push(frontier.mass());
    run.frontier = Some(frontier);
    Ok(run)
}

/// One expansion step: query, combine, rank, select, gather.
#[allow(clippy::cast_possible_truncation)]
fn advance_history<O: NextTokenOracle>(
    oracle: &O,
    run: &mut HistoryRun,
    i: usize,
    pos: usize,
    schedule: &mut CoverageSchedule,
    mask: &[bool],
    config: &BeamSearchConfig,
) -> Result<()> {
    let Some(frontier) = run.frontier.as_mut() else {
        return Ok(());
    };
    let vocab = oracle.vocab_size();
    let width = frontier.width();

    let last: Vec<Vec<u32>> = frontier.last_tokens().iter().map(|&t| vec![t]).collect();
    let tokens = Tensor::new(last, oracle.device())?;
    let (probs, state) = oracle.next(&tokens, Some(frontier.state()), config.temperature)?;
    let mut rows = probs_to_rows(&probs, width, vocab)?;

    for row in &mut rows {
        stabilize_row(row, mask, config.eps);
        if let Err(reason) = check_distribution(row) {
            run.status = SearchStatus::Aborted { step: pos, reason };
            return Ok(());
        }
    }

    // Joint surface: cumulative log-probability of every (candidate, token)
    // extension, flattened and ranked exactly.
    let mut surface: Vec<(f64, usize)> = Vec::with_capacity(width * vocab);
    for (r, row) in rows.iter().enumerate() {
        let base = frontier.log_probs()[r];
        for (t, &p) in row.iter().enumerate() {
            surface.push((base + p.ln(), r * vocab + t));
        }
    }
    surface.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    let new_width = match schedule.fixed_width(i) {
        Some(w) => w.min(surface.len()),
        None => {
            // Percentile mode: exponentiate the ranked surface, renormalize,
            // walk its cumulative mass up to the current threshold.
            let exp: Vec<f64> = surface.iter().map(|&(lp, _)| lp.exp()).collect();
            let total: f64 = exp.iter().sum();
            if !(total.is_finite() && total > 0.0) {
                run.status = SearchStatus::Aborted {
                    step: pos,
                    reason: format!("joint surface mass degenerated to {total}"),
                };
                return Ok(());
            }
            let renormalized: Vec<f64> = exp.iter().map(|p| p / total).collect();
            if renormalized.iter().any(|p| p.is_nan()) {
                run.status = SearchStatus::Aborted {
                    step: pos,
                    reason: "NaN in renormalized probability surface".to_string(),
                };
                return Ok(());
            }
            let threshold = schedule.threshold(i).unwrap_or(1.0);
            width_from_mass(threshold, &renormalized)
        }
    };

    run.widths.push(new_width);
    schedule.advance(i);
    if let Some(threshold) = schedule.threshold(i) {
        run.coverages.push(threshold);
    }

    let kept = &surface[..new_width];
    let origin_rows: Vec<u32> = kept.iter().map(|&(_, flat)| (flat / vocab) as u32).collect();
    let emitted: Vec<u32> = kept.iter().map(|&(_, flat)| (flat % vocab) as u32).collect();
    let log_probs: Vec<f64> = kept.iter().map(|&(lp, _)| lp).collect();
    frontier.advance(&origin_rows, &emitted, log_probs, &state)?;
    run.bounds.push(frontier.mass());
    Ok(())
}
