//! Spatial self-attention encoder layer
//!
//! Every cell of the feature grid attends to its row and its column through
//! [`MultiheadRcda`], with the row and column position embeddings added to two
//! separate copies of the features.

use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, Dropout, LayerNorm, Module, VarBuilder};

use super::attention::MultiheadRcda;
use super::ffn::Ffn;
use crate::config::AnchorDetrConfig;

pub struct SpatialEncoderLayer {
    self_attn: MultiheadRcda,
    dropout1: Dropout,
    norm1: LayerNorm,
    ffn: Ffn,
}

impl SpatialEncoderLayer {
    pub fn load(config: &AnchorDetrConfig, vb: VarBuilder) -> Result<Self> {
        let d_model = config.d_model;
        let self_attn = MultiheadRcda::load(d_model, config.nhead, config.dropout, vb.pp("self_attn"))?;
        let norm1 = layer_norm(d_model, 1e-5, vb.pp("norm1"))?;
        let ffn = Ffn::load(
            d_model,
            config.dim_feedforward,
            config.dropout,
            config.activation,
            vb.pp("ffn"),
        )?;

        Ok(Self {
            self_attn,
            dropout1: Dropout::new(config.dropout),
            norm1,
            ffn,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `src` - Feature grid `[n, c, h, w]` where `n = batch * levels`
    /// * `mask` - Padding mask `[n, h, w]`
    /// * `posemb_row` - Column-wise embeddings `[n, w, c]`, one per column index
    /// * `posemb_col` - Row-wise embeddings `[n, h, c]`, one per row index
    ///
    /// # Returns
    /// Refined grid `[n, c, h, w]`
    pub fn forward(
        &self,
        src: &Tensor,
        mask: &Tensor,
        posemb_row: &Tensor,
        posemb_col: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (n, c, h, w) = src.dims4()?;
        let src = src.permute((0, 2, 3, 1))?.contiguous()?; // [n, h, w, c]

        let posemb_row = posemb_row.unsqueeze(1)?.broadcast_as((n, h, w, c))?;
        let posemb_col = posemb_col.unsqueeze(2)?.broadcast_as((n, h, w, c))?;
        let src_row = (&src + &posemb_row)?;
        let src_col = (&src + &posemb_col)?;

        let query_row = src_row.reshape((n, h * w, c))?;
        let query_col = src_col.reshape((n, h * w, c))?;

        let src2 = self.self_attn.forward(
            &query_row,
            &query_col,
            &src_row,
            &src_col,
            &src,
            Some(mask),
            train,
        )?;
        let src2 = src2.reshape((n, h, w, c))?;

        let src = (&src + self.dropout1.forward(&src2, train)?)?;
        let src = self.norm1.forward(&src)?;
        let src = self.ffn.forward(&src, train)?;

        src.permute((0, 3, 1, 2))?.contiguous()
    }
}
