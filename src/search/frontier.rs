//! The live candidate set for one history.

use crate::error::Result;
use crate::oracle::state::ModelState;

/// Live candidates for one history at one step.
///
/// Token rows, cumulative log-probabilities, and opaque state rows always
/// share one permutation; every re-index goes through [`Frontier::advance`],
/// so no field can drift from the others.
#[derive(Debug, Clone)]
pub struct Frontier {
    sequences: Vec<Vec<u32>>,
    log_probs: Vec<f64>,
    state: ModelState,
}

impl Frontier {
    /// Seed the root frontier from the top tokens of the initial
    /// distribution: one copy of the history per token, each extended by
    /// that token, over as many copies of the single root state row.
    ///
    /// # Errors
    /// Returns an error if the root state cannot be tiled.
    pub fn seed(
        history: &[u32],
        tokens: &[u32],
        log_probs: Vec<f64>,
        root_state: &ModelState,
    ) -> Result<Self> {
        debug_assert_eq!(tokens.len(), log_probs.len());
        let state = root_state.repeat(tokens.len())?;
        let sequences = tokens
            .iter()
            .map(|&t| {
                let mut seq = history.to_vec();
                seq.push(t);
                seq
            })
            .collect();
        Ok(Self {
            sequences,
            log_probs,
            state,
        })
    }

    /// Number of live candidates.
    #[must_use]
    pub fn width(&self) -> usize {
        self.sequences.len()
    }

    #[must_use]
    pub fn sequences(&self) -> &[Vec<u32>] {
        &self.sequences
    }

    #[must_use]
    pub fn log_probs(&self) -> &[f64] {
        &self.log_probs
    }

    #[must_use]
    pub fn state(&self) -> &ModelState {
        &self.state
    }

    /// Last token of every row: the next oracle input.
    #[must_use]
    pub fn last_tokens(&self) -> Vec<u32> {
        self.sequences
            .iter()
            .map(|seq| *seq.last().unwrap_or(&0))
            .collect()
    }

    /// Total retained probability mass.
    #[must_use]
    pub fn mass(&self) -> f64 {
        self.log_probs.iter().map(|lp| lp.exp()).sum()
    }

    /// Replace the frontier with the kept joint-surface entries.
    ///
    /// `rows[k]` is the originating candidate of kept entry `k`: its
    /// sequence is extended with `tokens[k]`, its cumulative
    /// log-probability replaced by `log_probs[k]`, and the freshly updated
    /// oracle state is gathered by the same row list (duplicating parents
    /// that back several children).
    ///
    /// # Errors
    /// Returns an error if the state gather fails.
    pub fn advance(
        &mut self,
        rows: &[u32],
        tokens: &[u32],
        log_probs: Vec<f64>,
        updated_state: &ModelState,
    ) -> Result<()> {
        debug_assert_eq!(rows.len(), tokens.len());
        debug_assert_eq!(rows.len(), log_probs.len());
        let state = updated_state.gather(rows)?;
        let sequences: Vec<Vec<u32>> = rows
            .iter()
            .zip(tokens)
            .map(|(&row, &token)| {
                let mut seq = self.sequences[row as usize].clone();
                seq.push(token);
                seq
            })
            .collect();
        self.sequences = sequences;
        self.log_probs = log_probs;
        self.state = state;
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (Vec<Vec<u32>>, Vec<f64>) {
        (self.sequences, self.log_probs)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::*;

    fn root_state() -> ModelState {
        let device = Device::Cpu;
        ModelState::Hidden(Tensor::from_vec(vec![1.0f32, 2.0], (1, 1, 2), &device).unwrap())
    }

    #[test]
    fn test_seed_extends_history_with_each_token() {
        let frontier =
            Frontier::seed(&[3, 7], &[1, 4], vec![-0.1, -0.9], &root_state()).unwrap();
        assert_eq!(frontier.width(), 2);
        assert_eq!(frontier.sequences(), &[vec![3, 7, 1], vec![3, 7, 4]]);
        assert_eq!(frontier.last_tokens(), vec![1, 4]);
        assert_eq!(frontier.state().rows().unwrap(), 2);
    }

    #[test]
    fn test_advance_reindexes_all_fields_together() {
        let mut frontier =
            Frontier::seed(&[5], &[0, 1, 2], vec![-0.2, -0.4, -0.8], &root_state()).unwrap();
        let updated = root_state().repeat(3).unwrap();

        // Entry 0 and 1 both descend from old row 2; entry 2 from old row 0.
        frontier
            .advance(&[2, 2, 0], &[9, 8, 7], vec![-1.0, -1.1, -1.2], &updated)
            .unwrap();

        assert_eq!(frontier.width(), 3);
        assert_eq!(
            frontier.sequences(),
            &[vec![5, 2, 9], vec![5, 2, 8], vec![5, 0, 7]]
        );
        assert_eq!(frontier.log_probs(), &[-1.0, -1.1, -1.2]);
        assert_eq!(frontier.state().rows().unwrap(), 3);
    }

    #[test]
    fn test_mass_sums_exponentiated_log_probs() {
        let frontier = Frontier::seed(
            &[1],
            &[0, 1],
            vec![0.5f64.ln(), 0.25f64.ln()],
            &root_state(),
        )
        .unwrap();
        assert!((frontier.mass() - 0.75).abs() < 1e-12);
    }
}
