pub mod attention;
pub mod decoder;
pub mod encoder;
pub mod ffn;
pub mod heads;
pub mod pos_enc;
pub mod query_embed;
pub mod transformer;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::config::AnchorDetrConfig;
use crate::model::heads::INITIAL_WH_BIAS;

pub use crate::model::transformer::{Transformer, TransformerOutput};

/// Build a freshly initialised transformer.
///
/// Returns the model together with the `VarMap` holding its parameters, which is what
/// an optimizer steps on. The last box layer bias is set to `[0, 0, -2, -2]` so initial
/// boxes are small and centered on their reference points.
pub fn init_transformer(
    config: &AnchorDetrConfig,
    dtype: DType,
    device: &Device,
) -> Result<(Transformer, VarMap)> {
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, device);
    let transformer = Transformer::load(config, vb)?;

    let bbox_bias = Tensor::new(&[0f32, 0.0, INITIAL_WH_BIAS, INITIAL_WH_BIAS], device)?
        .to_dtype(dtype)?;
    varmap.set_one("bbox_embed.layers.2.bias", &bbox_bias)?;

    let num_params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
    log::info!(
        "initialised transformer: {} parameters, {} queries",
        num_params,
        transformer.num_queries()
    );
    Ok((transformer, varmap))
}
