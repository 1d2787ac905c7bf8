//! Feed-forward blocks shared by the encoder and the decoder.
//!
//! - [`Ffn`]: `norm(x + dropout(linear2(dropout(act(linear1(x))))))`
//! - [`Mlp`]: plain stack of linear layers with ReLU in between, used for the box head
//!   and the positional adapters

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{layer_norm, linear, Dropout, LayerNorm, Linear, VarBuilder};

use crate::config::Activation;

impl Activation {
    /// Width of the activation output for a given input width
    pub fn output_dim(&self, input_dim: usize) -> usize {
        match self {
            Activation::Glu => input_dim / 2,
            Activation::Relu | Activation::Gelu => input_dim,
        }
    }

    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Relu => xs.relu(),
            Activation::Gelu => xs.gelu_erf(),
            Activation::Glu => {
                let half = xs.dim(D::Minus1)? / 2;
                let a = xs.narrow(D::Minus1, 0, half)?;
                let b = xs.narrow(D::Minus1, half, half)?;
                a.mul(&candle_nn::ops::sigmoid(&b)?)
            }
        }
    }
}

/// Position-wise feed-forward block with residual connection and layer norm
pub struct Ffn {
    linear1: Linear,
    linear2: Linear,
    activation: Activation,
    dropout2: Dropout,
    dropout3: Dropout,
    norm2: LayerNorm,
}

impl Ffn {
    /// Build the block. With `glu` the second projection reads half of `d_ffn`.
    pub fn load(
        d_model: usize,
        d_ffn: usize,
        dropout: f32,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let linear1 = linear(d_model, d_ffn, vb.pp("linear1"))?;
        let linear2 = linear(activation.output_dim(d_ffn), d_model, vb.pp("linear2"))?;
        let norm2 = layer_norm(d_model, 1e-5, vb.pp("norm2"))?;

        Ok(Self {
            linear1,
            linear2,
            activation,
            dropout2: Dropout::new(dropout),
            dropout3: Dropout::new(dropout),
            norm2,
        })
    }

    /// Forward pass, input `[..., d_model]` with rank at most 4
    pub fn forward(&self, src: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.activation.apply(&self.linear1.forward(src)?)?;
        let hidden = self.dropout2.forward(&hidden, train)?;
        let src2 = self.linear2.forward(&hidden)?;
        let src = (src + self.dropout3.forward(&src2, train)?)?;
        self.norm2.forward(&src)
    }
}

/// Multi-Layer Perceptron
///
/// Linear layers with ReLU activations between them, none after the last one.
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    /// Wrap already built layers, e.g. an `nn.Sequential(Linear, ReLU, Linear)` layout.
    pub fn from_layers(layers: Vec<Linear>) -> Self {
        Self { layers }
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut output = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            output = layer.forward(&output)?;
            if i < self.layers.len() - 1 {
                output = output.relu()?;
            }
        }
        Ok(output)
    }
}
