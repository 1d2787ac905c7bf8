//! Prediction heads and reference-relative box refinement
//!
//! The class and box projections are a single parameter set shared by every decoder
//! layer. [`LayerHeads`] keeps one owned [`DetectionHead`] and maps each layer index
//! onto it, so predictions of all layers move together when those parameters change.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{init, linear, Init, Linear, VarBuilder};

use super::ffn::Mlp;

/// Prior probability used for the class bias, so training starts with low scores
pub const PRIOR_PROB: f64 = 0.01;

/// Bias of the last box layer for the `(w, h)` outputs, sigmoid(-2) ~ 0.12
pub const INITIAL_WH_BIAS: f32 = -2.0;

/// Numerically safe logit: `log(x / (1 - x))` with both terms clamped to at least `eps`.
///
/// Inputs are first clamped to `[0, 1]`.
pub fn inverse_sigmoid(xs: &Tensor, eps: f64) -> Result<Tensor> {
    let xs = xs.clamp(0f64, 1f64)?;
    let x1 = xs.clamp(eps, 1f64)?;
    let x2 = (1.0 - &xs)?.clamp(eps, 1f64)?;
    (x1 / x2)?.log()
}

/// Apply a box delta relative to a reference point and map back to `[0, 1]`.
///
/// # Arguments
/// * `delta` - Raw box head output `[..., 4]`
/// * `reference` - Reference points `[..., 2]` (center only) or `[..., 4]`
///
/// # Returns
/// `sigmoid(delta + inverse_sigmoid(reference))`, where a 2D reference only shifts the
/// first two components.
pub fn refine_boxes(delta: &Tensor, reference: &Tensor) -> Result<Tensor> {
    let coords = reference.dim(D::Minus1)?;
    let reference = inverse_sigmoid(reference, 1e-5)?;

    let refined = match coords {
        4 => delta.broadcast_add(&reference)?,
        2 => {
            let width = delta.dim(D::Minus1)?;
            let xy = delta.narrow(D::Minus1, 0, 2)?.broadcast_add(&reference)?;
            let wh = delta.narrow(D::Minus1, 2, width - 2)?;
            Tensor::cat(&[&xy, &wh], D::Minus1)?
        }
        other => candle_core::bail!("reference points must have 2 or 4 coordinates, got {}", other),
    };
    candle_nn::ops::sigmoid(&refined)
}

/// Class and box projections for one decoder output
pub struct DetectionHead {
    class_embed: Linear,
    bbox_embed: Mlp,
}

impl DetectionHead {
    /// Build the heads under `class_embed` and `bbox_embed`.
    ///
    /// Fresh parameters start with a class bias of `-ln((1 - p) / p)` and an all-zero last
    /// box layer. The `(w, h)` bias is set by [`crate::model::init_transformer`].
    pub fn load(d_model: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let bias_value = -((1.0 - PRIOR_PROB) / PRIOR_PROB).ln();
        let class_vb = vb.pp("class_embed");
        let class_embed = Linear::new(
            class_vb.get_with_hints((num_classes, d_model), "weight", init::DEFAULT_KAIMING_NORMAL)?,
            Some(class_vb.get_with_hints(num_classes, "bias", Init::Const(bias_value))?),
        );

        let bbox_vb = vb.pp("bbox_embed").pp("layers");
        let last_vb = bbox_vb.pp("2");
        let bbox_embed = Mlp::from_layers(vec![
            linear(d_model, d_model, bbox_vb.pp("0"))?,
            linear(d_model, d_model, bbox_vb.pp("1"))?,
            Linear::new(
                last_vb.get_with_hints((4, d_model), "weight", Init::Const(0.0))?,
                Some(last_vb.get_with_hints(4, "bias", Init::Const(0.0))?),
            ),
        ]);

        Ok(Self {
            class_embed,
            bbox_embed,
        })
    }

    /// Returns `(class_logits [..., num_classes], box_delta [..., 4])`
    pub fn forward(&self, hidden: &Tensor) -> Result<(Tensor, Tensor)> {
        let logits = self.class_embed.forward(hidden)?;
        let delta = self.bbox_embed.forward(hidden)?;
        Ok((logits, delta))
    }
}

/// Heads indexed per decoder layer, backed by a shared set of modules
pub struct LayerHeads {
    heads: Vec<DetectionHead>,
    assignment: Vec<usize>,
}

impl LayerHeads {
    /// Every layer uses the same `head`
    pub fn shared(head: DetectionHead, num_layers: usize) -> Self {
        Self {
            heads: vec![head],
            assignment: vec![0; num_layers],
        }
    }

    pub fn for_layer(&self, layer: usize) -> Result<&DetectionHead> {
        match self.assignment.get(layer) {
            Some(&idx) => Ok(&self.heads[idx]),
            None => candle_core::bail!(
                "no prediction head for layer {} ({} layers)",
                layer,
                self.assignment.len()
            ),
        }
    }
}
