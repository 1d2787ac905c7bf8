//! Attention blocks for Anchor DETR
//!
//! - [`MultiheadAttention`]: standard batch-first multi-head attention, used for the
//!   query self-attention in the decoder
//! - [`MultiheadRcda`]: row/column decoupled attention. Every query attends to the
//!   columns of a 2D feature grid and, independently, to its rows; the two weight maps
//!   are combined as an outer product over the grid. Cost is `O(Q * (H + W))` per head
//!   for the weights instead of `O(Q * H * W)`.

use candle_core::{IndexOp, Module, Result, Tensor};
use candle_nn::{linear, Dropout, Init, Linear, VarBuilder};

/// Xavier/Glorot uniform init hint for a `[fan_out, fan_in]` weight
pub(crate) fn xavier_uniform(fan_in: usize, fan_out: usize) -> Init {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// `[b, n, heads * head_dim]` -> `[b, heads, n, head_dim]`
fn split_heads(xs: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    let (b, n, _) = xs.dims3()?;
    xs.reshape((b, n, num_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()
}

/// `[b, heads, n, head_dim]` -> `[b, n, heads * head_dim]`
fn merge_heads(xs: &Tensor) -> Result<Tensor> {
    let (b, heads, n, head_dim) = xs.dims4()?;
    xs.transpose(1, 2)?
        .contiguous()?
        .reshape((b, n, heads * head_dim))
}

/// Replace scores with `-inf` where `mask` is non-zero. `mask` must broadcast to `scores`.
fn masked_fill_neg_inf(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = mask.broadcast_as(scores.dims())?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.dims(), scores.device())?
        .to_dtype(scores.dtype())?;
    mask.where_cond(&neg_inf, scores)
}

/// Multi-head attention with a packed `in_proj_weight` / `in_proj_bias`
pub struct MultiheadAttention {
    num_heads: usize,
    head_dim: usize,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    dropout: Dropout,
}

impl MultiheadAttention {
    pub fn load(embed_dim: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let head_dim = embed_dim / num_heads;

        let in_proj_weight = vb.get_with_hints(
            (3 * embed_dim, embed_dim),
            "in_proj_weight",
            xavier_uniform(embed_dim, 3 * embed_dim),
        )?;
        let in_proj_bias = vb.get_with_hints(3 * embed_dim, "in_proj_bias", Init::Const(0.0))?;

        // q, k and v are row blocks of the packed projection
        let block = |i: usize| -> Result<Linear> {
            Ok(Linear::new(
                in_proj_weight.narrow(0, i * embed_dim, embed_dim)?,
                Some(in_proj_bias.narrow(0, i * embed_dim, embed_dim)?),
            ))
        };
        let out_proj = linear(embed_dim, embed_dim, vb.pp("out_proj"))?;

        Ok(Self {
            num_heads,
            head_dim,
            q_proj: block(0)?,
            k_proj: block(1)?,
            v_proj: block(2)?,
            out_proj,
            dropout: Dropout::new(dropout),
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `query` - `[batch_size, len_q, embed_dim]`
    /// * `key` - `[batch_size, len_k, embed_dim]`
    /// * `value` - `[batch_size, len_k, embed_dim]`
    pub fn forward(&self, query: &Tensor, key: &Tensor, value: &Tensor, train: bool) -> Result<Tensor> {
        let scale = (self.head_dim as f64).sqrt();

        let q = split_heads(&self.q_proj.forward(query)?, self.num_heads, self.head_dim)?;
        let k = split_heads(&self.k_proj.forward(key)?, self.num_heads, self.head_dim)?;
        let v = split_heads(&self.v_proj.forward(value)?, self.num_heads, self.head_dim)?;

        let attn_weights = (q.matmul(&k.t()?.contiguous()?)? / scale)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;

        let attn_output = merge_heads(&attn_weights.matmul(&v)?)?;
        self.out_proj.forward(&attn_output)
    }
}

/// Row/column decoupled multi-head attention
///
/// Parameters: `q_row_proj_weight`, `q_col_proj_weight`, `k_row_proj_weight`,
/// `k_col_proj_weight`, `v_proj_weight` (each `[E, E]`), a packed `in_proj_bias`
/// of `5 * E` in the same order, and `out_proj`.
pub struct MultiheadRcda {
    num_heads: usize,
    head_dim: usize,
    q_row_proj: Linear,
    q_col_proj: Linear,
    k_row_proj: Linear,
    k_col_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    dropout: Dropout,
}

impl MultiheadRcda {
    pub fn load(embed_dim: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let head_dim = embed_dim / num_heads;
        let in_proj_bias = vb.get_with_hints(5 * embed_dim, "in_proj_bias", Init::Const(0.0))?;

        let proj = |name: &str, i: usize| -> Result<Linear> {
            let weight = vb.get_with_hints(
                (embed_dim, embed_dim),
                name,
                xavier_uniform(embed_dim, embed_dim),
            )?;
            let bias = in_proj_bias.narrow(0, i * embed_dim, embed_dim)?;
            Ok(Linear::new(weight, Some(bias)))
        };

        Ok(Self {
            num_heads,
            head_dim,
            q_row_proj: proj("q_row_proj_weight", 0)?,
            q_col_proj: proj("q_col_proj_weight", 1)?,
            k_row_proj: proj("k_row_proj_weight", 2)?,
            k_col_proj: proj("k_col_proj_weight", 3)?,
            v_proj: proj("v_proj_weight", 4)?,
            out_proj: linear(embed_dim, embed_dim, vb.pp("out_proj"))?,
            dropout: Dropout::new(dropout),
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `query_row` - Queries matched against column keys `[batch, len_q, E]`
    /// * `query_col` - Queries matched against row keys `[batch, len_q, E]`
    /// * `key_row` - `[batch, H, W, E]`, averaged over H to give one key per column
    /// * `key_col` - `[batch, H, W, E]`, averaged over W to give one key per row
    /// * `value` - `[batch, H, W, E]`
    /// * `key_padding_mask` - Optional `[batch, H, W]`, non-zero marks padded cells
    ///
    /// # Returns
    /// `[batch, len_q, E]`
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        query_row: &Tensor,
        query_col: &Tensor,
        key_row: &Tensor,
        key_col: &Tensor,
        value: &Tensor,
        key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (b, len_q, _) = query_row.dims3()?;
        let (value_b, h, w, _) = value.dims4()?;
        if value_b != b || key_row.dims() != value.dims() || key_col.dims() != value.dims() {
            candle_core::bail!(
                "rcda shape mismatch: query {:?}, key_row {:?}, key_col {:?}, value {:?}",
                query_row.dims(),
                key_row.dims(),
                key_col.dims(),
                value.dims()
            );
        }
        let (heads, head_dim) = (self.num_heads, self.head_dim);
        let scaling = (head_dim as f64).powf(-0.5);

        let q_row = (self.q_row_proj.forward(query_row)? * scaling)?;
        let q_col = (self.q_col_proj.forward(query_col)? * scaling)?;
        // affine projection commutes with the mean
        let k_row = self.k_row_proj.forward(&key_row.mean(1)?)?; // [b, W, E]
        let k_col = self.k_col_proj.forward(&key_col.mean(2)?)?; // [b, H, E]
        let v = self.v_proj.forward(value)?; // [b, H, W, E]

        let q_row = split_heads(&q_row, heads, head_dim)?; // [b, heads, Q, d]
        let q_col = split_heads(&q_col, heads, head_dim)?;
        let k_row = split_heads(&k_row, heads, head_dim)?; // [b, heads, W, d]
        let k_col = split_heads(&k_col, heads, head_dim)?; // [b, heads, H, d]

        // [b, H, W, heads, d] -> [b, heads, W, H * d]
        let v = v
            .reshape((b, h, w, heads, head_dim))?
            .permute((0, 3, 2, 1, 4))?
            .contiguous()?
            .reshape((b, heads, w, h * head_dim))?;

        let mut attn_row = q_row.matmul(&k_row.t()?.contiguous()?)?; // [b, heads, Q, W]
        let mut attn_col = q_col.matmul(&k_col.t()?.contiguous()?)?; // [b, heads, Q, H]

        if let Some(mask) = key_padding_mask {
            let mask_row = mask.i((.., 0, ..))?.reshape((b, 1, 1, w))?;
            let mask_col = mask.i((.., .., 0))?.reshape((b, 1, 1, h))?;
            attn_row = masked_fill_neg_inf(&attn_row, &mask_row)?;
            attn_col = masked_fill_neg_inf(&attn_col, &mask_col)?;
        }

        let attn_row = candle_nn::ops::softmax_last_dim(&attn_row)?;
        let attn_col = candle_nn::ops::softmax_last_dim(&attn_col)?;
        let attn_row = self.dropout.forward(&attn_row, train)?;
        let attn_col = self.dropout.forward(&attn_col, train)?;

        // Reduce over columns first, then over rows. Batched matmul takes at most two
        // batch dims, so (b, heads, Q) are folded into one.
        let per_row = attn_row
            .matmul(&v)? // [b, heads, Q, H * d]
            .reshape((b * heads * len_q, h, head_dim))?;
        let output = attn_col
            .contiguous()?
            .reshape((b * heads * len_q, 1, h))?
            .matmul(&per_row)?
            .reshape((b, heads, len_q, head_dim))?;

        self.out_proj.forward(&merge_heads(&output)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn rcda(embed_dim: usize, heads: usize) -> (MultiheadRcda, VarMap) {
        let vs = VarMap::new();
        let vb = VarBuilder::from_varmap(&vs, DType::F32, &Device::Cpu);
        (MultiheadRcda::load(embed_dim, heads, 0.0, vb).unwrap(), vs)
    }

    fn padded_mask(b: usize, h: usize, w: usize, valid_h: usize, valid_w: usize) -> Tensor {
        let mut data = vec![1u8; b * h * w];
        for i in 0..b {
            for r in 0..valid_h {
                for c in 0..valid_w {
                    data[i * h * w + r * w + c] = 0;
                }
            }
        }
        Tensor::from_vec(data, (b, h, w), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_multihead_attention_shape() {
        let device = Device::Cpu;
        let vs = VarMap::new();
        let vb = VarBuilder::from_varmap(&vs, DType::F32, &device);
        let attn = MultiheadAttention::load(32, 4, 0.0, vb).unwrap();

        let query = Tensor::randn(0f32, 1f32, (2, 7, 32), &device).unwrap();
        let memory = Tensor::randn(0f32, 1f32, (2, 11, 32), &device).unwrap();
        let output = attn.forward(&query, &memory, &memory, false).unwrap();
        assert_eq!(output.dims(), &[2, 7, 32]);
    }

    #[test]
    fn test_rcda_shape() {
        let device = Device::Cpu;
        let (attn, _vs) = rcda(16, 4);

        let queries = Tensor::randn(0f32, 1f32, (2, 9, 16), &device).unwrap();
        let grid = Tensor::randn(0f32, 1f32, (2, 5, 6, 16), &device).unwrap();
        let mask = padded_mask(2, 5, 6, 4, 3);
        let output = attn
            .forward(&queries, &queries, &grid, &grid, &grid, Some(&mask), false)
            .unwrap();
        assert_eq!(output.dims(), &[2, 9, 16]);
    }

    #[test]
    fn test_rcda_constant_value_passes_through() {
        // Both weight maps sum to one, so a constant value grid comes out unchanged
        // (up to the value and output projections)
        let device = Device::Cpu;
        let (attn, _vs) = rcda(8, 2);

        let queries = Tensor::randn(0f32, 1f32, (1, 3, 8), &device).unwrap();
        let keys = Tensor::randn(0f32, 1f32, (1, 4, 5, 8), &device).unwrap();
        let token = Tensor::randn(0f32, 1f32, (1, 1, 1, 8), &device).unwrap();
        let value = token.broadcast_as((1, 4, 5, 8)).unwrap().contiguous().unwrap();

        let output = attn
            .forward(&queries, &queries, &keys, &keys, &value, None, false)
            .unwrap();
        let expected = attn
            .out_proj
            .forward(&attn.v_proj.forward(&token.reshape((1, 1, 8)).unwrap()).unwrap())
            .unwrap();

        let output = output.to_vec3::<f32>().unwrap();
        let expected = expected.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for query in &output[0] {
            for (got, want) in query.iter().zip(expected.iter()) {
                assert_abs_diff_eq!(*got, *want, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_rcda_ignores_padded_values() {
        let device = Device::Cpu;
        let (attn, _vs) = rcda(8, 2);
        let (h, w) = (4, 5);

        let queries = Tensor::randn(0f32, 1f32, (1, 6, 8), &device).unwrap();
        let keys = Tensor::randn(0f32, 1f32, (1, h, w, 8), &device).unwrap();
        let value = Tensor::randn(0f32, 1f32, (1, h, w, 8), &device).unwrap();
        let mask = padded_mask(1, h, w, 3, 2);

        // Overwrite every padded cell of the value grid with large numbers
        let noise = (Tensor::randn(0f32, 1f32, (1, h, w, 8), &device).unwrap() * 1000.0).unwrap();
        let padded = mask.unsqueeze(3).unwrap().broadcast_as((1, h, w, 8)).unwrap();
        let corrupted = padded.where_cond(&noise, &value).unwrap();

        let clean = attn
            .forward(&queries, &queries, &keys, &keys, &value, Some(&mask), false)
            .unwrap();
        let dirty = attn
            .forward(&queries, &queries, &keys, &keys, &corrupted, Some(&mask), false)
            .unwrap();

        let clean = clean.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let dirty = dirty.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in clean.iter().zip(dirty.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_rcda_batch_items_are_independent() {
        let device = Device::Cpu;
        let (attn, _vs) = rcda(16, 4);
        let (h, w) = (3, 4);

        let queries = Tensor::randn(0f32, 1f32, (2, 5, 16), &device).unwrap();
        let grid = Tensor::randn(0f32, 1f32, (2, h, w, 16), &device).unwrap();
        let mask = padded_mask(2, h, w, 2, 3);
        let batched = attn
            .forward(&queries, &queries, &grid, &grid, &grid, Some(&mask), false)
            .unwrap();
        assert_eq!(batched.dims(), &[2, 5, 16]);

        for i in 0..2 {
            let q = queries.narrow(0, i, 1).unwrap();
            let g = grid.narrow(0, i, 1).unwrap();
            let m = mask.narrow(0, i, 1).unwrap();
            let single = attn
                .forward(&q, &q, &g, &g, &g, Some(&m), false)
                .unwrap();
            let expected = single.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let got = batched
                .narrow(0, i, 1)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap();
            for (a, b) in got.iter().zip(expected.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_rcda_rejects_mismatched_grid() {
        let device = Device::Cpu;
        let (attn, _vs) = rcda(8, 2);
        let queries = Tensor::zeros((1, 2, 8), DType::F32, &device).unwrap();
        let grid = Tensor::zeros((1, 3, 3, 8), DType::F32, &device).unwrap();
        let other = Tensor::zeros((1, 3, 4, 8), DType::F32, &device).unwrap();
        assert!(attn
            .forward(&queries, &queries, &grid, &other, &grid, None, false)
            .is_err());
    }
}
