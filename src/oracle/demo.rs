//! Deterministic synthetic oracle.
//!
//! A tiny tanh-recurrence language model over seeded pseudo-random weights.
//! It exists so the CLI and the test suite can exercise the estimators
//! without an external checkpoint; it is not a trained model.

use candle_core::{DType, Device, Result, Tensor};
use rand::{Rng, SeedableRng};

use super::state::{ModelState, StateKind};
use super::NextTokenOracle;

/// Synthetic recurrent next-token model.
///
/// `h' = tanh(embed[token] + h W)`, `p = softmax(h' V / temperature)`. The
/// weights are filled from a seeded RNG, so two oracles built with the same
/// shape and seed are byte-identical.
pub struct DemoOracle {
    vocab_size: usize,
    hidden: usize,
    device: Device,
    /// (vocab, hidden)
    embed: Tensor,
    /// (hidden, hidden)
    recur: Tensor,
    /// (hidden, vocab)
    output: Tensor,
}

impl DemoOracle {
    /// Build a model with weights drawn from a seeded RNG.
    ///
    /// # Errors
    /// Returns an error if tensor creation fails.
    pub fn new(vocab_size: usize, hidden: usize, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let embed = random_tensor(&mut rng, (vocab_size, hidden), device)?;
        let recur = random_tensor(&mut rng, (hidden, hidden), device)?;
        let output = random_tensor(&mut rng, (hidden, vocab_size), device)?;
        Ok(Self {
            vocab_size,
            hidden,
            device: device.clone(),
            embed,
            recur,
            output,
        })
    }

    /// Advance one token column: returns the next hidden state.
    fn recur_step(&self, tokens: &[u32], hidden: &Tensor) -> Result<Tensor> {
        let idx = Tensor::new(tokens.to_vec(), &self.device)?;
        let x = self.embed.index_select(&idx, 0)?;
        (x + hidden.matmul(&self.recur)?)?.tanh()
    }
}

impl NextTokenOracle for DemoOracle {
    fn vocab_size(&self) -> usize {
        self.vocab_size
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
        temperature: f64,
    ) -> Result<(Tensor, ModelState)> {
        let columns = tokens.to_vec2::<u32>()?;
        let batch = columns.len();
        let positions = columns.first().map_or(0, Vec::len);
        if positions == 0 {
            return Err(candle_core::Error::Msg(
                "oracle queried with an empty token batch".to_string(),
            ));
        }

        let mut hidden = match state {
            Some(ModelState::Hidden(h)) => h.squeeze(0)?,
            Some(_) => {
                return Err(candle_core::Error::Msg(
                    "DemoOracle only consumes flat recurrent state".to_string(),
                ))
            }
            None => Tensor::zeros((batch, self.hidden), DType::F32, &self.device)?,
        };

        for pos in 0..positions {
            let column: Vec<u32> = columns.iter().map(|row| row[pos]).collect();
            hidden = self.recur_step(&column, &hidden)?;
        }

        let logits = (hidden.matmul(&self.output)? * (1.0 / temperature))?;
        let probs = candle_nn::ops::softmax_last_dim(&logits)?;
        Ok((probs, ModelState::Hidden(hidden.unsqueeze(0)?)))
    }
}

fn random_tensor(
    rng: &mut rand::rngs::StdRng,
    shape: (usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let (rows, cols) = shape;
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-0.5..0.5))
        .collect();
    Tensor::from_vec(data, shape, device)
}
