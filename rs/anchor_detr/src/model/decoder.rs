//! Anchor DETR decoder layer
//!
//! Each layer contains:
//! 1. Self-attention over the object queries, 2D anchor embedding added to query/key
//! 2. Row/column decoupled cross-attention against every feature level
//! 3. Feed-forward network

use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, Dropout, LayerNorm, Module, VarBuilder};

use super::attention::{MultiheadAttention, MultiheadRcda};
use super::ffn::Ffn;
use crate::config::AnchorDetrConfig;

/// Per-query position biases derived from the reference points
pub struct QueryPositions {
    /// 2D embedding `[b, q, c]`, used by self-attention
    pub pos: Tensor,
    /// 1D embedding of the x coordinate `[b, q, c]`, matched against column keys
    pub pos_x: Tensor,
    /// 1D embedding of the y coordinate `[b, q, c]`, matched against row keys
    pub pos_y: Tensor,
}

/// Encoded features shared by all decoder layers
pub struct DecoderMemory<'a> {
    /// Encoder output `[b * l, c, h, w]`, batch-major
    pub srcs: &'a Tensor,
    /// Padding mask `[b * l, h, w]`
    pub mask: &'a Tensor,
    /// `[b * l, w, c]`
    pub posemb_row: &'a Tensor,
    /// `[b * l, h, c]`
    pub posemb_col: &'a Tensor,
    pub num_levels: usize,
}

pub struct DecoderLayer {
    cross_attn: MultiheadRcda,
    dropout1: Dropout,
    norm1: LayerNorm,

    self_attn: MultiheadAttention,
    dropout2: Dropout,
    norm2: LayerNorm,

    ffn: Ffn,
}

impl DecoderLayer {
    pub fn load(config: &AnchorDetrConfig, vb: VarBuilder) -> Result<Self> {
        let d_model = config.d_model;
        let cross_attn =
            MultiheadRcda::load(d_model, config.nhead, config.dropout, vb.pp("cross_attn"))?;
        let self_attn =
            MultiheadAttention::load(d_model, config.nhead, config.dropout, vb.pp("self_attn"))?;

        let ffn = Ffn::load(
            d_model,
            config.dim_feedforward,
            config.dropout,
            config.activation,
            vb.pp("ffn"),
        )?;

        Ok(Self {
            cross_attn,
            dropout1: Dropout::new(config.dropout),
            norm1: layer_norm(d_model, 1e-5, vb.pp("norm1"))?,
            self_attn,
            dropout2: Dropout::new(config.dropout),
            norm2: layer_norm(d_model, 1e-5, vb.pp("norm2"))?,
            ffn,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `tgt` - Query content `[b, q, c]`
    /// * `query_pos` - Position biases for the current reference points
    /// * `memory` - Encoder output and its row/column embeddings
    ///
    /// # Returns
    /// Updated query content `[b, q, c]`
    pub fn forward(
        &self,
        tgt: &Tensor,
        query_pos: &QueryPositions,
        memory: &DecoderMemory,
        train: bool,
    ) -> Result<Tensor> {
        let (b, q, c) = tgt.dims3()?;
        let levels = memory.num_levels;
        let n = memory.srcs.dim(0)?;
        if n != b * levels {
            candle_core::bail!(
                "decoder memory holds {} grids, expected batch {} x levels {}",
                n,
                b,
                levels
            );
        }

        // Self-attention
        let q_k = (tgt + &query_pos.pos)?;
        let tgt2 = self.self_attn.forward(&q_k, &q_k, tgt, train)?;
        let tgt = (tgt + self.dropout2.forward(&tgt2, train)?)?;
        let tgt = self.norm2.forward(&tgt)?;

        // Cross-attention, queries repeated for every level
        let per_level = |xs: Tensor| -> Result<Tensor> {
            xs.unsqueeze(1)?
                .broadcast_as((b, levels, q, c))?
                .reshape((n, q, c))
        };
        let query_row = per_level((&tgt + &query_pos.pos_x)?)?;
        let query_col = per_level((&tgt + &query_pos.pos_y)?)?;

        let srcs = memory.srcs.permute((0, 2, 3, 1))?.contiguous()?; // [n, h, w, c]
        let key_row = srcs.broadcast_add(&memory.posemb_row.unsqueeze(1)?)?;
        let key_col = srcs.broadcast_add(&memory.posemb_col.unsqueeze(2)?)?;

        let tgt2 = self.cross_attn.forward(
            &query_row,
            &query_col,
            &key_row,
            &key_col,
            &srcs,
            Some(memory.mask),
            train,
        )?;
        // Sum the per-level results back onto each image
        let tgt2 = tgt2.reshape((b, levels, q, c))?.sum(1)?;

        let tgt = (tgt + self.dropout1.forward(&tgt2, train)?)?;
        let tgt = self.norm1.forward(&tgt)?;

        self.ffn.forward(&tgt, train)
    }
}
