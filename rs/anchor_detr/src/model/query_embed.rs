//! Query Embeddings for Anchor DETR
//!
//! Object queries are `(pattern, position)` pairs:
//!
//! 1. **Pattern embeddings (`pattern.weight`)**: Shape `[num_pattern, d_model]`
//!    - Learned content shared by every anchor position
//!
//! 2. **Anchor positions**: Shape `[num_position, 2]` holding normalized `(x, y)`
//!    - `learned`: embedding table `position.weight`, initialised uniformly in `[0, 1]`
//!    - `grid`: fixed cell centers of a `round(sqrt(num_position))` square grid
//!
//! Query `p * num_position + k` carries pattern `p` anchored at position `k`.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::config::{grid_side, AnchorDetrConfig, SpatialPrior};

/// Cell centers of a `side x side` grid, `[side * side, 2]`.
///
/// Entry `i * side + j` is `((i + 0.5) / side, (j + 0.5) / side)`.
pub fn grid_positions(side: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = Vec::with_capacity(side * side * 2);
    for i in 0..side {
        for j in 0..side {
            data.push((i as f32 + 0.5) / side as f32);
            data.push((j as f32 + 0.5) / side as f32);
        }
    }
    Tensor::from_vec(data, (side * side, 2), device)?.to_dtype(dtype)
}

#[derive(Debug)]
pub struct QueryEmbeddings {
    /// `[num_pattern, d_model]`
    pattern: Tensor,
    /// `[num_position, 2]`
    position: Tensor,
}

impl QueryEmbeddings {
    pub fn load(config: &AnchorDetrConfig, vb: VarBuilder) -> Result<Self> {
        let pattern = vb.get_with_hints(
            (config.num_query_pattern, config.d_model),
            "pattern.weight",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;

        let position = match config.spatial_prior {
            SpatialPrior::Learned => vb.get_with_hints(
                (config.num_query_position, 2),
                "position.weight",
                Init::Uniform { lo: 0.0, up: 1.0 },
            )?,
            SpatialPrior::Grid => grid_positions(
                grid_side(config.num_query_position),
                vb.dtype(),
                vb.device(),
            )?,
        };

        Ok(Self { pattern, position })
    }

    pub fn num_pattern(&self) -> usize {
        self.pattern.dims()[0]
    }

    /// Anchor positions actually in use (a perfect square for the grid prior)
    pub fn num_position(&self) -> usize {
        self.position.dims()[0]
    }

    pub fn num_queries(&self) -> usize {
        self.num_pattern() * self.num_position()
    }

    /// Reference points `[batch, num_pattern * num_position, 2]`
    pub fn reference_points(&self, batch_size: usize) -> Result<Tensor> {
        self.position
            .unsqueeze(0)?
            .repeat((batch_size, self.num_pattern(), 1))
    }

    /// Initial query content `[batch, num_pattern * num_position, d_model]`
    pub fn query_content(&self, batch_size: usize) -> Result<Tensor> {
        let (num_pattern, d_model) = self.pattern.dims2()?;
        let num_position = self.num_position();
        self.pattern
            .reshape((1, num_pattern, 1, d_model))?
            .repeat((batch_size, 1, num_position, 1))?
            .reshape((batch_size, num_pattern * num_position, d_model))
    }
}
