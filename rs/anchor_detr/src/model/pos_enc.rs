//! Sinusoidal Position Embeddings for Anchor DETR
//!
//! Normalized coordinates in `[0, 1]` are scaled by `2π`, divided by a geometric
//! frequency bank `temperature ** (2 * (i // 2) / num_pos_feats)` and mapped to
//! interleaved `sin, cos, sin, cos, ...` features.
//!
//! - 1D: `[...]` -> `[..., num_pos_feats]` (row/column positions and query x/y)
//! - 2D: `[..., 2]` -> `[..., 2 * num_pos_feats]`, y features first, then x
//!
//! Coordinates outside `[0, 1]` are accepted but produce meaningless embeddings.
//!
//! The row/column coordinates themselves come from the padding mask, see
//! [`mask_to_positions`].

use candle_core::{DType, Device, IndexOp, Result, Tensor, D};

/// Default temperature for the frequency bank
pub const DEFAULT_TEMPERATURE: f64 = 10000.0;

/// Frequency bank: `dim_t[i] = temperature ** (2 * (i // 2) / num_pos_feats)`
fn frequency_bank(
    num_pos_feats: usize,
    temperature: f64,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let dim_t: Vec<f32> = (0..num_pos_feats)
        .map(|i| {
            let exponent = 2.0 * ((i / 2) as f64) / (num_pos_feats as f64);
            temperature.powf(exponent) as f32
        })
        .collect();
    Tensor::from_vec(dim_t, num_pos_feats, device)?.to_dtype(dtype)
}

/// Apply sin to even feature indices and cos to odd ones, keeping them interleaved.
///
/// Input and output: `[..., n]` with `n` even.
fn sin_cos_interleaved(pos: &Tensor) -> Result<Tensor> {
    let dims = pos.dims().to_vec();
    let n = dims[dims.len() - 1];

    // [..., n] -> [..., n/2, 2]: index 0 of the pair is even, index 1 is odd
    let mut paired = dims.clone();
    paired.pop();
    paired.push(n / 2);
    paired.push(2);
    let pairs = pos.reshape(paired)?;

    let sin = pairs.narrow(D::Minus1, 0, 1)?.sin()?;
    let cos = pairs.narrow(D::Minus1, 1, 1)?.cos()?;
    Tensor::cat(&[&sin, &cos], D::Minus1)?.reshape(dims)
}

/// 1D sinusoidal embedding of normalized coordinates.
///
/// # Arguments
/// * `pos` - Coordinates of any shape `[...]`, expected in `[0, 1]`
/// * `num_pos_feats` - Output feature dimension (256 in the reference model), must be even
/// * `temperature` - Frequency bank temperature (typically 10000)
///
/// # Returns
/// Tensor of shape `[..., num_pos_feats]`
pub fn sine_embed_1d(pos: &Tensor, num_pos_feats: usize, temperature: f64) -> Result<Tensor> {
    if num_pos_feats % 2 != 0 {
        candle_core::bail!("num_pos_feats must be even, got {}", num_pos_feats);
    }
    let scale = 2.0 * std::f64::consts::PI;
    let dim_t = frequency_bank(num_pos_feats, temperature, pos.dtype(), pos.device())?;

    let pos = (pos * scale)?.unsqueeze(D::Minus1)?.broadcast_div(&dim_t)?;
    sin_cos_interleaved(&pos)
}

/// 2D sinusoidal embedding of normalized `(x, y)` coordinates.
///
/// # Arguments
/// * `pos` - Coordinates of shape `[..., 2]` holding `(x, y)`
/// * `num_pos_feats` - Features per axis (128 in the reference model)
/// * `temperature` - Frequency bank temperature
///
/// # Returns
/// Tensor of shape `[..., 2 * num_pos_feats]`, the y embedding followed by the x embedding
pub fn sine_embed_2d(pos: &Tensor, num_pos_feats: usize, temperature: f64) -> Result<Tensor> {
    let coords = pos.dim(D::Minus1)?;
    if coords != 2 {
        candle_core::bail!("sine_embed_2d expects (x, y) coordinates, got last dim {}", coords);
    }
    let x = pos.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
    let y = pos.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?;

    let pos_x = sine_embed_1d(&x, num_pos_feats, temperature)?;
    let pos_y = sine_embed_1d(&y, num_pos_feats, temperature)?;
    Tensor::cat(&[&pos_y, &pos_x], D::Minus1)
}

/// Normalized row and column coordinates of the valid region of a padding mask.
///
/// The valid region is assumed to be a prefix rectangle, so only the first column
/// (for rows) and the first row (for columns) are inspected. Each coordinate is the
/// running count of valid cells, offset by `-0.5` and divided by the total valid count.
/// An axis without any valid cell divides by zero and yields NaN/inf.
///
/// # Arguments
/// * `mask` - Padding mask `[batch, height, width]`, non-zero marks padded cells
///
/// # Returns
/// `(y, x)` with `y: [batch, height]` and `x: [batch, width]`, in f32
pub fn mask_to_positions(mask: &Tensor) -> Result<(Tensor, Tensor)> {
    let (_b, h, w) = mask.dims3()?;
    let not_mask = mask.eq(0.0)?.to_dtype(DType::F32)?;

    let y = not_mask.i((.., .., 0))?.contiguous()?.cumsum(1)?;
    let x = not_mask.i((.., 0, ..))?.contiguous()?.cumsum(1)?;

    let y_total = y.narrow(1, h - 1, 1)?;
    let x_total = x.narrow(1, w - 1, 1)?;

    let y = (y - 0.5)?.broadcast_div(&y_total)?;
    let x = (x - 0.5)?.broadcast_div(&x_total)?;
    Ok((y, x))
}
