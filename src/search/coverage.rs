//! Beam-width coverage policies.
//!
//! Decides how many candidates survive each pruning step. Policies only see
//! scalars: the pruning target (absolute width or probability-mass
//! fraction), the per-step threshold, and the sorted probabilities of the
//! current joint surface — never candidate content.

use serde::Serialize;

use crate::error::{Error, Result};

/// Threshold-update rule applied between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageKind {
    /// Absolute beam count, constant every step.
    FixedWidth,
    /// Constant-ratio geometric decay: each step multiplies the threshold by
    /// the per-step root value `coverage^(1/steps)`.
    Backoff,
    /// Linear descent from the per-step root value down to the target
    /// coverage over the remaining steps.
    Interpolate,
}

/// Per-history pruning target: an absolute beam count or a probability-mass
/// fraction in (0, 1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageTarget {
    Width(usize),
    Mass(f64),
}

#[derive(Debug, Clone)]
enum Entry {
    Width(usize),
    Mass {
        original: f64,
        current: f64,
        step: f64,
    },
}

/// Validated per-history coverage schedule.
///
/// Built once before any oracle call; [`CoverageSchedule::advance`] is the
/// only mutation and runs once per generation step.
#[derive(Debug, Clone)]
pub struct CoverageSchedule {
    kind: CoverageKind,
    entries: Vec<Entry>,
}

impl CoverageSchedule {
    /// Validate targets and derive per-history root thresholds.
    ///
    /// `targets` is a single broadcast target or one target per history;
    /// `gen_lens` the number of generation steps per history. Mass targets
    /// get a root threshold of `coverage^(1/steps)`; interpolate targets
    /// additionally get the per-step decrement `(root - coverage) /
    /// (steps - 1)` (zero when only one step remains).
    ///
    /// # Errors
    /// Returns a configuration error on an empty or mis-sized target list,
    /// mixed widths and mass fractions, a mass outside (0, 1), a zero
    /// width, or integer widths under the `interpolate` kind.
    pub fn new(kind: CoverageKind, targets: &[CoverageTarget], gen_lens: &[usize]) -> Result<Self> {
        let targets: Vec<CoverageTarget> = match targets.len() {
            0 => {
                return Err(Error::config(
                    "beam_widths",
                    "at least one coverage target is required",
                ))
            }
            1 => vec![targets[0]; gen_lens.len()],
            n if n == gen_lens.len() => targets.to_vec(),
            n => {
                return Err(Error::config(
                    "beam_widths",
                    format!("{n} coverage targets for {} histories", gen_lens.len()),
                ))
            }
        };

        let any_width = targets.iter().any(|s| matches!(s, CoverageTarget::Width(_)));
        let any_mass = targets.iter().any(|s| matches!(s, CoverageTarget::Mass(_)));
        if any_width && any_mass {
            return Err(Error::config(
                "beam_widths",
                "mixed absolute widths and mass fractions",
            ));
        }
        if kind == CoverageKind::Interpolate && any_width {
            return Err(Error::config(
                "beam_widths",
                "interpolate coverage requires mass fractions in (0, 1)",
            ));
        }

        let mut entries = Vec::with_capacity(targets.len());
        for (&target, &gen_len) in targets.iter().zip(gen_lens) {
            entries.push(match target {
                CoverageTarget::Width(0) => {
                    return Err(Error::config("beam_widths", "width must be positive"))
                }
                CoverageTarget::Width(w) => Entry::Width(w),
                CoverageTarget::Mass(m) => {
                    if !(m.is_finite() && 0.0 < m && m < 1.0) {
                        return Err(Error::config(
                            "beam_widths",
                            format!("coverage must be between 0 and 1, got {m}"),
                        ));
                    }
                    #[allow(clippy::cast_precision_loss)]
                    let original = m.powf(1.0 / gen_len as f64);
                    #[allow(clippy::cast_precision_loss)]
                    let step = if kind == CoverageKind::Interpolate && gen_len > 1 {
                        (original - m) / (gen_len - 1) as f64
                    } else {
                        0.0
                    };
                    Entry::Mass {
                        original,
                        current: original,
                        step,
                    }
                }
            });
        }
        Ok(Self { kind, entries })
    }

    /// Whether this schedule prunes by retained mass rather than count.
    #[must_use]
    pub fn is_mass(&self) -> bool {
        matches!(self.entries.first(), Some(Entry::Mass { .. }))
    }

    /// The threshold currently in force for history `i` (mass mode only).
    #[must_use]
    pub fn threshold(&self, i: usize) -> Option<f64> {
        match self.entries.get(i) {
            Some(Entry::Mass { current, .. }) => Some(*current),
            _ => None,
        }
    }

    /// The per-step root threshold for history `i` (mass mode only).
    #[must_use]
    pub fn original(&self, i: usize) -> Option<f64> {
        match self.entries.get(i) {
            Some(Entry::Mass { original, .. }) => Some(*original),
            _ => None,
        }
    }

    /// The absolute beam count for history `i` (fixed-width mode only).
    #[must_use]
    pub fn fixed_width(&self, i: usize) -> Option<usize> {
        match self.entries.get(i) {
            Some(Entry::Width(w)) => Some(*w),
            _ => None,
        }
    }

    /// Width to keep from a descending, renormalized probability surface.
    ///
    /// Fixed widths are clamped to the number of available entries; mass
    /// thresholds walk the cumulative sum from the top.
    #[must_use]
    pub fn width_for(&self, i: usize, sorted_probs: &[f64]) -> usize {
        match &self.entries[i] {
            Entry::Width(w) => (*w).min(sorted_probs.len()),
            Entry::Mass { current, .. } => width_from_mass(*current, sorted_probs),
        }
    }

    /// Move history `i`'s threshold to the value for the next step.
    pub fn advance(&mut self, i: usize) {
        if let Entry::Mass {
            original,
            current,
            step,
        } = &mut self.entries[i]
        {
            match self.kind {
                CoverageKind::FixedWidth => *current = *original,
                CoverageKind::Backoff => *current *= *original,
                CoverageKind::Interpolate => *current -= *step,
            }
        }
    }
}

/// Count of top entries whose cumulative mass first reaches `threshold`.
///
/// `sorted_probs` must be descending and sum to 1; the count is inclusive of
/// the entry that crosses the threshold.
#[must_use]
pub fn width_from_mass(threshold: f64, sorted_probs: &[f64]) -> usize {
    let mut cumulative = 0.0;
    for (count, &p) in sorted_probs.iter().enumerate() {
        cumulative += p;
        if cumulative >= threshold {
            return count + 1;
        }
    }
    sorted_probs.len()
}

/// Optional variance-splitting pruning strategy.
///
/// Over a descending probability list, picks the prefix length (up to
/// `max_width`) that minimizes the summed population variance of the prefix
/// and the remainder — a cheap split between the "head" the search should
/// keep and the low-probability tail. Not wired into the driving loop;
/// exported for ablation drivers.
#[must_use]
pub fn min_variance_split(sorted_probs: &[f64], max_width: usize) -> usize {
    let n = sorted_probs.len();
    if n <= 2 || max_width <= 1 {
        return n.min(max_width).max(1);
    }

    let upper = n.min(max_width + 1);
    let mut best_split = 1;
    let mut best_var = f64::INFINITY;
    for split in 1..upper {
        let var = population_variance(&sorted_probs[..split])
            + population_variance(&sorted_probs[split..]);
        if var < best_var {
            best_var = var;
            best_split = split;
        }
    }
    best_split
}

#[allow(clippy::cast_precision_loss)]
fn population_variance(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n
}
