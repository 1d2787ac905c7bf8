//! Anchor DETR Transformer
//!
//! Fuses a multi-level feature map with anchor-point queries:
//! - Row/column position embeddings derived once from the padding mask
//! - Spatial self-attention encoder stack over every level
//! - Decoder stack over `num_pattern * num_position` queries, with a class/box
//!   prediction after every layer (deep supervision)
//!
//! Boxes of every layer are refined relative to the same initial reference points.
//! The reference points are not updated between layers, so the query position biases
//! are computed once per forward pass.

use candle_core::{IndexOp, Module, Result, Tensor, D};
use candle_nn::{linear, VarBuilder};

use super::decoder::{DecoderLayer, DecoderMemory, QueryPositions};
use super::encoder::SpatialEncoderLayer;
use super::ffn::Mlp;
use super::heads::{refine_boxes, DetectionHead, LayerHeads};
use super::pos_enc::{mask_to_positions, sine_embed_1d, sine_embed_2d};
use super::query_embed::QueryEmbeddings;
use crate::config::AnchorDetrConfig;

/// Predictions of every decoder layer
#[derive(Debug, Clone)]
pub struct TransformerOutput {
    /// `[num_layers, batch, num_queries, num_classes]`
    pub class_logits: Tensor,
    /// `[num_layers, batch, num_queries, 4]`, `(cx, cy, w, h)` in `[0, 1]`
    pub boxes: Tensor,
}

impl TransformerOutput {
    pub fn num_layers(&self) -> Result<usize> {
        self.class_logits.dim(0)
    }

    /// Final-layer `(class_logits, boxes)`, each without the layer dimension
    pub fn last_layer(&self) -> Result<(Tensor, Tensor)> {
        let last = self.num_layers()? - 1;
        Ok((self.class_logits.i(last)?, self.boxes.i(last)?))
    }

    /// Predictions of every layer but the last, in layer order
    pub fn aux_layers(&self) -> Result<Vec<(Tensor, Tensor)>> {
        let num_layers = self.num_layers()?;
        (0..num_layers.saturating_sub(1))
            .map(|i| Ok((self.class_logits.i(i)?, self.boxes.i(i)?)))
            .collect()
    }
}

/// `nn.Sequential(Linear, ReLU, Linear)` stored under `{0, 2}`
fn load_adapter(d_model: usize, vb: VarBuilder) -> Result<Mlp> {
    Ok(Mlp::from_layers(vec![
        linear(d_model, d_model, vb.pp("0"))?,
        linear(d_model, d_model, vb.pp("2"))?,
    ]))
}

pub struct Transformer {
    config: AnchorDetrConfig,
    encoder_layers: Vec<SpatialEncoderLayer>,
    decoder_layers: Vec<DecoderLayer>,
    queries: QueryEmbeddings,
    adapt_pos1d: Mlp,
    adapt_pos2d: Mlp,
    heads: LayerHeads,
}

impl Transformer {
    /// Build the transformer. Every encoder/decoder layer gets its own parameters, the
    /// class/box heads are one parameter set shared by all decoder layers.
    pub fn load(config: &AnchorDetrConfig, vb: VarBuilder) -> Result<Self> {
        config.validate().map_err(candle_core::Error::wrap)?;
        let d_model = config.d_model;

        let encoder_layers = (0..config.num_encoder_layers)
            .map(|i| SpatialEncoderLayer::load(config, vb.pp(format!("encoder_layers.{}", i))))
            .collect::<Result<Vec<_>>>()?;
        let decoder_layers = (0..config.num_decoder_layers)
            .map(|i| DecoderLayer::load(config, vb.pp(format!("decoder_layers.{}", i))))
            .collect::<Result<Vec<_>>>()?;

        let queries = QueryEmbeddings::load(config, vb.clone())?;
        let adapt_pos1d = load_adapter(d_model, vb.pp("adapt_pos1d"))?;
        let adapt_pos2d = load_adapter(d_model, vb.pp("adapt_pos2d"))?;

        let head = DetectionHead::load(d_model, config.num_classes, vb.clone())?;
        let heads = LayerHeads::shared(head, config.num_decoder_layers);

        Ok(Self {
            config: config.clone(),
            encoder_layers,
            decoder_layers,
            queries,
            adapt_pos1d,
            adapt_pos2d,
            heads,
        })
    }

    pub fn config(&self) -> &AnchorDetrConfig {
        &self.config
    }

    pub fn num_queries(&self) -> usize {
        self.queries.num_queries()
    }

    /// 1D position embedding followed by the shared 1D adapter
    fn embed_1d(&self, pos: &Tensor) -> Result<Tensor> {
        let embed = sine_embed_1d(pos, self.config.d_model, self.config.temperature)?;
        self.adapt_pos1d.forward(&embed)
    }

    /// Position biases of the queries for reference points `[b, q, 2]`
    fn query_positions(&self, reference_points: &Tensor) -> Result<QueryPositions> {
        let embed_2d = sine_embed_2d(
            reference_points,
            self.config.d_model / 2,
            self.config.temperature,
        )?;
        let x = reference_points.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
        let y = reference_points.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?;

        Ok(QueryPositions {
            pos: self.adapt_pos2d.forward(&embed_2d)?,
            pos_x: self.embed_1d(&x)?,
            pos_y: self.embed_1d(&y)?,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `srcs` - Feature map `[batch, levels, d_model, height, width]`
    /// * `masks` - Padding masks `[batch, height, width]`, one per level. Only the last
    ///   one is used, non-zero marks padded cells. Every image needs at least one valid
    ///   row and column.
    /// * `train` - Enables dropout
    pub fn forward(&self, srcs: &Tensor, masks: &[Tensor], train: bool) -> Result<TransformerOutput> {
        let (b, l, c, h, w) = srcs.dims5()?;
        if c != self.config.d_model {
            candle_core::bail!(
                "feature map has {} channels, the transformer expects d_model = {}",
                c,
                self.config.d_model
            );
        }
        let mask = match masks.last() {
            Some(mask) => mask,
            None => candle_core::bail!("at least one padding mask is required"),
        };
        if mask.dims() != [b, h, w] {
            candle_core::bail!(
                "padding mask shape {:?} does not match features [{}, {}, {}]",
                mask.dims(),
                b,
                h,
                w
            );
        }
        log::debug!("transformer input {:?}, mask {:?}", srcs.dims(), mask.dims());

        // Same mask for every level, batch-major
        let mask = mask
            .ne(0.0)?
            .unsqueeze(1)?
            .repeat((1, l, 1, 1))?
            .reshape((b * l, h, w))?;
        let (pos_col, pos_row) = mask_to_positions(&mask)?;
        let posemb_row = self.embed_1d(&pos_row.to_dtype(srcs.dtype())?)?; // [b*l, w, c]
        let posemb_col = self.embed_1d(&pos_col.to_dtype(srcs.dtype())?)?; // [b*l, h, c]

        let mut memory = srcs.reshape((b * l, c, h, w))?;
        for layer in &self.encoder_layers {
            memory = layer.forward(&memory, &mask, &posemb_row, &posemb_col, train)?;
        }
        log::debug!("encoder output {:?}", memory.dims());

        let reference_points = self.queries.reference_points(b)?;
        let query_pos = self.query_positions(&reference_points)?;
        let decoder_memory = DecoderMemory {
            srcs: &memory,
            mask: &mask,
            posemb_row: &posemb_row,
            posemb_col: &posemb_col,
            num_levels: l,
        };

        let mut output = self.queries.query_content(b)?;
        let mut outputs_classes = Vec::with_capacity(self.decoder_layers.len());
        let mut outputs_coords = Vec::with_capacity(self.decoder_layers.len());

        for (layer_id, layer) in self.decoder_layers.iter().enumerate() {
            output = layer.forward(&output, &query_pos, &decoder_memory, train)?;

            let (outputs_class, box_delta) = self.heads.for_layer(layer_id)?.forward(&output)?;
            outputs_coords.push(refine_boxes(&box_delta, &reference_points)?);
            outputs_classes.push(outputs_class);
        }

        let class_logits = Tensor::stack(&outputs_classes, 0)?;
        let boxes = Tensor::stack(&outputs_coords, 0)?;
        log::debug!(
            "decoder predictions {:?}, boxes {:?}",
            class_logits.dims(),
            boxes.dims()
        );

        Ok(TransformerOutput {
            class_logits,
            boxes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpatialPrior;
    use crate::model::heads::INITIAL_WH_BIAS;
    use crate::model::init_transformer;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> AnchorDetrConfig {
        AnchorDetrConfig {
            num_classes: 5,
            d_model: 32,
            nhead: 4,
            num_encoder_layers: 2,
            num_decoder_layers: 3,
            dim_feedforward: 64,
            num_query_position: 4,
            num_query_pattern: 2,
            ..Default::default()
        }
    }

    /// Features `[b, l, 32, 6, 5]` and a mask where the second image is padded on the
    /// right by 2 columns and at the bottom by 1 row
    fn inputs(b: usize, l: usize) -> (Tensor, Vec<Tensor>) {
        let device = Device::Cpu;
        let (h, w) = (6, 5);
        let srcs = Tensor::randn(0f32, 1f32, (b, l, 32, h, w), &device).unwrap();

        let mut data = vec![0u8; b * h * w];
        if b > 1 {
            for r in 0..h {
                for c in 0..w {
                    if r >= h - 1 || c >= w - 2 {
                        data[h * w + r * w + c] = 1;
                    }
                }
            }
        }
        let mask = Tensor::from_vec(data, (b, h, w), &device).unwrap();
        (srcs, vec![mask])
    }

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let (model, _vs) = init_transformer(&small_config(), DType::F32, &Device::Cpu).unwrap();
        let (srcs, masks) = inputs(2, 1);

        let out = model.forward(&srcs, &masks, false).unwrap();
        assert_eq!(out.class_logits.dims(), &[3, 2, 8, 5]);
        assert_eq!(out.boxes.dims(), &[3, 2, 8, 4]);
        assert_eq!(out.num_layers().unwrap(), 3);

        let (logits, boxes) = out.last_layer().unwrap();
        assert_eq!(logits.dims(), &[2, 8, 5]);
        assert_eq!(boxes.dims(), &[2, 8, 4]);
        assert_eq!(out.aux_layers().unwrap().len(), 2);
    }

    #[test]
    fn test_forward_multi_level() {
        let (model, _vs) = init_transformer(&small_config(), DType::F32, &Device::Cpu).unwrap();
        let (srcs, masks) = inputs(2, 2);

        let out = model.forward(&srcs, &masks, false).unwrap();
        assert_eq!(out.class_logits.dims(), &[3, 2, 8, 5]);
        assert!(flat(&out.class_logits).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_boxes_in_unit_range() {
        let (model, _vs) = init_transformer(&small_config(), DType::F32, &Device::Cpu).unwrap();
        let (srcs, masks) = inputs(2, 1);
        let srcs = (srcs * 50.0).unwrap();

        let out = model.forward(&srcs, &masks, false).unwrap();
        let boxes = flat(&out.boxes);
        assert!(boxes.iter().all(|v| (0.0..=1.0).contains(v)), "{:?}", boxes);
    }

    #[test]
    fn test_forward_is_deterministic_without_dropout() {
        let config = AnchorDetrConfig {
            dropout: 0.1,
            ..small_config()
        };
        let (model, _vs) = init_transformer(&config, DType::F32, &Device::Cpu).unwrap();
        let (srcs, masks) = inputs(2, 1);

        let a = model.forward(&srcs, &masks, false).unwrap();
        let b = model.forward(&srcs, &masks, false).unwrap();
        assert_eq!(flat(&a.class_logits), flat(&b.class_logits));
        assert_eq!(flat(&a.boxes), flat(&b.boxes));
    }

    #[test]
    fn test_training_forward_applies_dropout() {
        let config = AnchorDetrConfig {
            dropout: 0.5,
            ..small_config()
        };
        let (model, _vs) = init_transformer(&config, DType::F32, &Device::Cpu).unwrap();
        let (srcs, masks) = inputs(2, 1);

        let eval = model.forward(&srcs, &masks, false).unwrap();
        let train = model.forward(&srcs, &masks, true).unwrap();
        assert_eq!(train.class_logits.dims(), eval.class_logits.dims());
        assert_eq!(train.boxes.dims(), eval.boxes.dims());
        assert!(flat(&train.class_logits).iter().all(|v| v.is_finite()));
        assert_ne!(flat(&train.class_logits), flat(&eval.class_logits));
    }

    #[test]
    fn test_grid_prior_rounds_positions() {
        let config = AnchorDetrConfig {
            spatial_prior: SpatialPrior::Grid,
            num_query_position: 10,
            ..small_config()
        };
        let (model, _vs) = init_transformer(&config, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.num_queries(), 18);

        let (srcs, masks) = inputs(1, 1);
        let out = model.forward(&srcs, &masks, false).unwrap();
        assert_eq!(out.boxes.dims(), &[3, 1, 18, 4]);
    }

    #[test]
    fn test_initial_boxes_sit_on_reference_points() {
        let (model, vs) = init_transformer(&small_config(), DType::F32, &Device::Cpu).unwrap();
        let (srcs, masks) = inputs(2, 1);
        let out = model.forward(&srcs, &masks, false).unwrap();

        let positions = vs.data().lock().unwrap()["position.weight"]
            .as_tensor()
            .to_vec2::<f32>()
            .unwrap();
        let wh = 1.0 / (1.0 + (-INITIAL_WH_BIAS).exp());
        let boxes = out.boxes.flatten_to(2).unwrap().to_vec2::<f32>().unwrap();
        // Flattened index is ((layer * b + batch) * q + query)
        for (idx, coords) in boxes.iter().enumerate() {
            let query = idx % 8;
            let anchor = &positions[query % 4];
            assert_abs_diff_eq!(coords[0], anchor[0], epsilon = 1e-4);
            assert_abs_diff_eq!(coords[1], anchor[1], epsilon = 1e-4);
            assert_abs_diff_eq!(coords[2], wh, epsilon = 1e-5);
            assert_abs_diff_eq!(coords[3], wh, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_heads_are_tied_across_layers() {
        let (model, mut vs) = init_transformer(&small_config(), DType::F32, &Device::Cpu).unwrap();
        let (srcs, masks) = inputs(2, 1);
        let before = model.forward(&srcs, &masks, false).unwrap();

        let bias = vs.data().lock().unwrap()["class_embed.bias"]
            .as_tensor()
            .clone();
        let shifted = (&bias + 1.0).unwrap();
        vs.set_one("class_embed.bias", &shifted).unwrap();
        let after = model.forward(&srcs, &masks, false).unwrap();

        // Decoder states do not depend on the heads, so every layer moves by exactly 1
        let diff = (&after.class_logits - &before.class_logits).unwrap();
        for v in flat(&diff) {
            assert_abs_diff_eq!(v, 1.0, epsilon = 1e-4);
        }
        assert_eq!(flat(&after.boxes), flat(&before.boxes));
    }

    #[test]
    fn test_layers_have_distinct_parameters() {
        let (_model, vs) = init_transformer(&small_config(), DType::F32, &Device::Cpu).unwrap();
        let data = vs.data().lock().unwrap();

        let first = flat(data["decoder_layers.0.cross_attn.q_row_proj_weight"].as_tensor());
        let last = flat(data["decoder_layers.2.cross_attn.q_row_proj_weight"].as_tensor());
        assert_ne!(first, last);
        assert!(data.contains_key("encoder_layers.1.self_attn.k_col_proj_weight"));
        assert!(data.contains_key("decoder_layers.2.self_attn.in_proj_weight"));
        assert!(data.contains_key("adapt_pos1d.2.weight"));
        assert!(data.contains_key("adapt_pos2d.0.bias"));

        // One class head and one box head, whatever the number of layers
        assert_eq!(data.keys().filter(|k| k.starts_with("class_embed.")).count(), 2);
        assert_eq!(data.keys().filter(|k| k.starts_with("bbox_embed.")).count(), 6);
    }

    #[test]
    fn test_contract_violations() {
        let (model, _vs) = init_transformer(&small_config(), DType::F32, &Device::Cpu).unwrap();
        let (srcs, masks) = inputs(2, 1);

        assert!(model.forward(&srcs, &[], false).is_err());

        let wrong_mask = Tensor::zeros((2, 3, 3), DType::U8, &Device::Cpu).unwrap();
        assert!(model.forward(&srcs, &[wrong_mask], false).is_err());

        let narrow = srcs.narrow(2, 0, 16).unwrap();
        assert!(model.forward(&narrow, &masks, false).is_err());
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let vs = VarMap::new();
        let vb = VarBuilder::from_varmap(&vs, DType::F32, &Device::Cpu);
        let config = AnchorDetrConfig {
            nhead: 5,
            ..small_config()
        };
        assert!(Transformer::load(&config, vb).is_err());
    }
}
