//! Opaque-state re-indexing.
//!
//! Candidates are re-ordered and pruned on every search step, so the state
//! rows the oracle handed back must follow the exact same permutation as the
//! token and log-probability rows. The helpers here re-index every leaf of a
//! state value identically without interpreting its contents.

use candle_core::{Result, Tensor};

/// Structural capability of an oracle's opaque state.
///
/// Declared once by the oracle; never inferred by probing tensor shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    /// Flat hidden state(s): candidate rows live on the batch dimension of
    /// `(layers, batch, hidden)` tensors.
    Recurrent,
    /// Per-layer key/value caches: candidate rows live on the batch
    /// dimension of `(batch, heads, positions, head_dim)` tensors, and the
    /// position dimension grows over the sequence.
    AttentionCache,
}

/// Which view of a cache a single-row selection should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowView {
    /// Keep the full position history (seeding a new root).
    Root,
    /// Keep only the most recent position (continuing a child).
    Child,
}

/// Opaque recurrent state threaded between oracle calls.
///
/// The engines never read tensor contents; they only re-index rows. The
/// variant is fixed by the oracle at construction and matches its declared
/// [`StateKind`].
#[derive(Debug, Clone)]
pub enum ModelState {
    /// Single hidden tensor (vanilla RNN / GRU), `(layers, batch, hidden)`.
    Hidden(Tensor),
    /// Hidden and cell tensors (LSTM), each `(layers, batch, hidden)`.
    HiddenCell(Tensor, Tensor),
    /// Per-layer `(key, value)` caches, each
    /// `(batch, heads, positions, head_dim)`.
    KvCache(Vec<(Tensor, Tensor)>),
}

const RECURRENT_BATCH_DIM: usize = 1;
const CACHE_BATCH_DIM: usize = 0;
const CACHE_POSITION_DIM: usize = 2;

impl ModelState {
    /// The capability tag of this state value.
    #[must_use]
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Hidden(_) | Self::HiddenCell(..) => StateKind::Recurrent,
            Self::KvCache(_) => StateKind::AttentionCache,
        }
    }

    /// Number of candidate rows this state describes.
    ///
    /// # Errors
    /// Returns an error if the state tensors are malformed (wrong rank, or
    /// an empty cache).
    pub fn rows(&self) -> Result<usize> {
        match self {
            Self::Hidden(h) | Self::HiddenCell(h, _) => h.dim(RECURRENT_BATCH_DIM),
            Self::KvCache(layers) => match layers.first() {
                Some((k, _)) => k.dim(CACHE_BATCH_DIM),
                None => Err(candle_core::Error::Msg(
                    "attention cache has no layers".to_string(),
                )),
            },
        }
    }

    /// Re-index every leaf by `rows`.
    ///
    /// Indices may repeat: one surviving parent candidate can back several
    /// children, each receiving a copy of its state row.
    ///
    /// # Errors
    /// Returns an error if an index is out of range or a leaf gather fails.
    pub fn gather(&self, rows: &[u32]) -> Result<Self> {
        match self {
            Self::Hidden(h) => Ok(Self::Hidden(gather_rows(h, rows, RECURRENT_BATCH_DIM)?)),
            Self::HiddenCell(h, c) => Ok(Self::HiddenCell(
                gather_rows(h, rows, RECURRENT_BATCH_DIM)?,
                gather_rows(c, rows, RECURRENT_BATCH_DIM)?,
            )),
            Self::KvCache(layers) => {
                let mut gathered = Vec::with_capacity(layers.len());
                for (k, v) in layers {
                    gathered.push((
                        gather_rows(k, rows, CACHE_BATCH_DIM)?,
                        gather_rows(v, rows, CACHE_BATCH_DIM)?,
                    ));
                }
                Ok(Self::KvCache(gathered))
            }
        }
    }

    /// Tile a single-row state to `width` identical rows.
    ///
    /// # Errors
    /// Returns an error if a leaf repeat fails.
    pub fn repeat(&self, width: usize) -> Result<Self> {
        match self {
            Self::Hidden(h) => Ok(Self::Hidden(tile(h, RECURRENT_BATCH_DIM, width)?)),
            Self::HiddenCell(h, c) => Ok(Self::HiddenCell(
                tile(h, RECURRENT_BATCH_DIM, width)?,
                tile(c, RECURRENT_BATCH_DIM, width)?,
            )),
            Self::KvCache(layers) => {
                let mut tiled = Vec::with_capacity(layers.len());
                for (k, v) in layers {
                    tiled.push((
                        tile(k, CACHE_BATCH_DIM, width)?,
                        tile(v, CACHE_BATCH_DIM, width)?,
                    ));
                }
                Ok(Self::KvCache(tiled))
            }
        }
    }

    /// Select one row, keeping a batch dimension of one.
    ///
    /// For attention caches the [`RowView::Child`] view keeps only the most
    /// recent position; [`RowView::Root`] keeps the full position history.
    /// Recurrent states carry no position axis, so both views coincide.
    ///
    /// # Errors
    /// Returns an error if `row` is out of range.
    pub fn select_row(&self, row: usize, view: RowView) -> Result<Self> {
        match self {
            Self::Hidden(h) => Ok(Self::Hidden(h.narrow(RECURRENT_BATCH_DIM, row, 1)?)),
            Self::HiddenCell(h, c) => Ok(Self::HiddenCell(
                h.narrow(RECURRENT_BATCH_DIM, row, 1)?,
                c.narrow(RECURRENT_BATCH_DIM, row, 1)?,
            )),
            Self::KvCache(layers) => {
                let mut selected = Vec::with_capacity(layers.len());
                for (k, v) in layers {
                    let mut k = k.narrow(CACHE_BATCH_DIM, row, 1)?;
                    let mut v = v.narrow(CACHE_BATCH_DIM, row, 1)?;
                    if view == RowView::Child {
                        let positions = k.dim(CACHE_POSITION_DIM)?;
                        k = k.narrow(CACHE_POSITION_DIM, positions - 1, 1)?;
                        v = v.narrow(CACHE_POSITION_DIM, positions - 1, 1)?;
                    }
                    selected.push((k, v));
                }
                Ok(Self::KvCache(selected))
            }
        }
    }
}

fn gather_rows(t: &Tensor, rows: &[u32], dim: usize) -> Result<Tensor> {
    let idx = Tensor::new(rows.to_vec(), t.device())?;
    t.index_select(&idx, dim)
}

fn tile(t: &Tensor, dim: usize, count: usize) -> Result<Tensor> {
    let mut reps = vec![1usize; t.dims().len()];
    reps[dim] = count;
    t.repeat(reps)
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    fn hidden_state(batch: usize) -> ModelState {
        let device = Device::Cpu;
        #[allow(clippy::cast_precision_loss)]
        let data: Vec<f32> = (0..batch * 3).map(|v| v as f32).collect();
        ModelState::Hidden(Tensor::from_vec(data, (1, batch, 3), &device).unwrap())
    }

    fn cache_state(batch: usize, positions: usize) -> ModelState {
        let device = Device::Cpu;
        let numel = batch * 2 * positions * 4;
        #[allow(clippy::cast_precision_loss)]
        let data: Vec<f32> = (0..numel).map(|v| v as f32).collect();
        let k = Tensor::from_vec(data.clone(), (batch, 2, positions, 4), &device).unwrap();
        let v = Tensor::from_vec(data, (batch, 2, positions, 4), &device).unwrap();
        ModelState::KvCache(vec![(k.clone(), v.clone()), (k, v)])
    }

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(hidden_state(2).kind(), StateKind::Recurrent);
        assert_eq!(cache_state(2, 3).kind(), StateKind::AttentionCache);
    }

    #[test]
    fn test_gather_reorders_and_duplicates_rows() {
        let state = hidden_state(3);
        let gathered = state.gather(&[2, 0, 2, 1]).unwrap();
        assert_eq!(gathered.rows().unwrap(), 4);

        let ModelState::Hidden(h) = &gathered else {
            panic!("gather changed the variant");
        };
        let values = h.to_vec3::<f32>().unwrap();
        // Row 2 of the source starts at value 6.0; it must appear twice.
        assert_eq!(values[0][0][0], 6.0);
        assert_eq!(values[0][1][0], 0.0);
        assert_eq!(values[0][2][0], 6.0);
        assert_eq!(values[0][3][0], 3.0);
    }

    #[test]
    fn test_gather_cache_reindexes_every_layer() {
        let state = cache_state(3, 2);
        let gathered = state.gather(&[1, 1]).unwrap();
        assert_eq!(gathered.rows().unwrap(), 2);

        let ModelState::KvCache(layers) = &gathered else {
            panic!("gather changed the variant");
        };
        assert_eq!(layers.len(), 2);
        for (k, v) in layers {
            assert_eq!(k.dims(), &[2, 2, 2, 4]);
            assert_eq!(v.dims(), &[2, 2, 2, 4]);
        }
    }

    #[test]
    fn test_repeat_tiles_single_row() {
        let state = hidden_state(1);
        let repeated = state.repeat(5).unwrap();
        assert_eq!(repeated.rows().unwrap(), 5);

        let ModelState::Hidden(h) = &repeated else {
            panic!("repeat changed the variant");
        };
        let values = h.to_vec3::<f32>().unwrap();
        for row in &values[0] {
            assert_eq!(row, &[0.0, 1.0, 2.0]);
        }
    }

    #[test]
    fn test_select_row_child_view_truncates_positions() {
        let state = cache_state(3, 4);

        let root = state.select_row(1, RowView::Root).unwrap();
        let ModelState::KvCache(layers) = &root else {
            panic!("select_row changed the variant");
        };
        assert_eq!(layers[0].0.dims(), &[1, 2, 4, 4]);

        let child = state.select_row(1, RowView::Child).unwrap();
        let ModelState::KvCache(layers) = &child else {
            panic!("select_row changed the variant");
        };
        assert_eq!(layers[0].0.dims(), &[1, 2, 1, 4]);
    }

    #[test]
    fn test_select_row_recurrent_ignores_view() {
        let state = hidden_state(3);
        for view in [RowView::Root, RowView::Child] {
            let selected = state.select_row(2, view).unwrap();
            let ModelState::Hidden(h) = &selected else {
                panic!("select_row changed the variant");
            };
            assert_eq!(h.dims(), &[1, 1, 3]);
            assert_eq!(h.to_vec3::<f32>().unwrap()[0][0][0], 6.0);
        }
    }

    #[test]
    fn test_hidden_cell_gathers_both_leaves() {
        let device = Device::Cpu;
        let h = Tensor::zeros((1, 2, 3), DType::F32, &device).unwrap();
        let c = Tensor::ones((1, 2, 3), DType::F32, &device).unwrap();
        let state = ModelState::HiddenCell(h, c);

        let gathered = state.gather(&[1, 0]).unwrap();
        let ModelState::HiddenCell(h, c) = &gathered else {
            panic!("gather changed the variant");
        };
        assert_eq!(h.dims(), &[1, 2, 3]);
        assert_eq!(c.to_vec3::<f32>().unwrap()[0][0][0], 1.0);
    }
}
