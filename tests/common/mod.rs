//! Shared oracle fixtures for integration tests.

#![allow(dead_code)]

use candle_core::{DType, Device, Result, Tensor};
use seq_prob::oracle::{ModelState, NextTokenOracle, StateKind};

/// Oracle returning one fixed distribution for every row, regardless of
/// input. State is a per-row counter so the engines still have rows to
/// thread.
pub struct TableOracle {
    probs: Vec<f32>,
    device: Device,
}

impl TableOracle {
    pub fn new(probs: &[f32]) -> Self {
        Self {
            probs: probs.to_vec(),
            device: Device::Cpu,
        }
    }
}

impl NextTokenOracle for TableOracle {
    fn vocab_size(&self) -> usize {
        self.probs.len()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn state_kind(&self) -> StateKind {
        StateKind::Recurrent
    }

    fn next(
        &self,
        tokens: &Tensor,
        state: Option<&ModelState>,
        _temperature: f64,
    ) -> Result<(Tensor, ModelState)> {
        let batch = tokens.dim(0)?;
        let row = Tensor::new(vec![self.probs.clone()], &self.device)?;
        let probs = row.repeat((batch, 1))?;
        let counter = match state {
            Some(ModelState::Hidden(h)) => (h.clone() + 1.0)?,
            _ => Tensor::zeros((1, batch, 1), DType::F32, &self.device)?,
        };
        Ok((probs, ModelState::Hidden(counter)))
    }
}

/// The deterministic peak pair of [`ChainOracle`] for two predecessor
/// tokens.
pub fn peak_pair(prev: u32, cur: u32, vocab: usize) -> (u32, u32) {
    let peak = (3 * cur as usize + 7 * prev as usize + 1) % vocab;
    let second = (peak + 1) % vocab;
    (peak as u32, second as u32)
}

/// Oracle whose distribution is a deterministic function of the last two
/// tokens of each row's lineage, with the older token carried in the opaque
/// state. Any drift between the engine's token rows and state rows shows up
/// as generated sequences violating the peak relation.
pub struct ChainOracle {
    vocab: usize,
    device: Device,
}

impl ChainOracle {
    pub fn new(vocab: usize) -> Self {
        assert!(vocab > 3);
        Self {
            vocab,
            device: Device::Cpu,
        }
    }

    fn distribution(&self, prev: u32, cur: u32, is_root: bool) -> Vec<f32> {
        let (peak, second) = peak_pair(prev, cur, self.vocab);
        let (p_peak, p_second): (f32, f32) = if is_root { (0.5, 0.45) } else { (0.72, 0.18) };
        let rest = (1.0 - p_peak - p_second) / (self.vocab - 2) as f32;
        let mut probs = vec![rest; self.vocab];
        probs[peak as usize] = p_peak;
        probs[second as usize] = p_second;
        probs
    }
}

impl NextTokenOracle for ChainOracle {
    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn state_kind(&self) -> StateKind {
        StateKind::Recurrent
    }

    fn next(
        &self,
        tokens: &Tensor,
        state: Option<&ModelState>,
        _temperature: f64,
    ) -> Result<(Tensor, ModelState)> {
        let rows = tokens.to_vec2::<u32>()?;
        let remembered: Option<Vec<Vec<Vec<f32>>>> = match state {
            Some(ModelState::Hidden(h)) => Some(h.to_vec3::<f32>()?),
            _ => None,
        };

        let mut probs = Vec::with_capacity(rows.len());
        let mut carried = Vec::with_capacity(rows.len());
        for (r, row) in rows.iter().enumerate() {
            let cur = *row.last().expect("non-empty token row");
            let prev = match &remembered {
                Some(h) => h[0][r][0] as u32,
                None if row.len() >= 2 => row[row.len() - 2],
                None => 0,
            };
            probs.push(self.distribution(prev, cur, remembered.is_none()));
            carried.push(cur as f32);
        }

        let probs = Tensor::new(probs, &self.device)?;
        let state = Tensor::from_vec(carried, (1, rows.len(), 1), &self.device)?;
        Ok((probs, ModelState::Hidden(state)))
    }
}

/// Oracle emitting a NaN distribution for any row whose input token equals
/// the trigger; other rows get a distribution peaked just above the input
/// token. Used to check that numeric failures stay per-history.
pub struct NanOracle {
    vocab: usize,
    trigger: u32,
    device: Device,
}

impl NanOracle {
    pub fn new(vocab: usize, trigger: u32) -> Self {
        Self {
            vocab,
            trigger,
            device: Device::Cpu,
        }
    }
}

impl NextTokenOracle for NanOracle {
    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn state_kind(&self) -> StateKind {
        StateKind::Recurrent
    }

    fn next(
        &self,
        tokens: &Tensor,
        state: Option<&ModelState>,
        _temperature: f64,
    ) -> Result<(Tensor, ModelState)> {
        let rows = tokens.to_vec2::<u32>()?;
        let mut probs = Vec::with_capacity(rows.len());
        for row in &rows {
            let cur = *row.last().expect("non-empty token row");
            if cur == self.trigger {
                probs.push(vec![f32::NAN; self.vocab]);
            } else {
                let rest = 0.10_f32 / (self.vocab - 2) as f32;
                let mut p = vec![rest; self.vocab];
                p[(cur as usize + 1) % self.vocab] = 0.55;
                p[(cur as usize + 2) % self.vocab] = 0.35;
                probs.push(p);
            }
        }
        let probs = Tensor::new(probs, &self.device)?;
        let counter = match state {
            Some(ModelState::Hidden(h)) => (h.clone() + 1.0)?,
            _ => Tensor::zeros((1, rows.len(), 1), DType::F32, &self.device)?,
        };
        Ok((probs, ModelState::Hidden(counter)))
    }
}
