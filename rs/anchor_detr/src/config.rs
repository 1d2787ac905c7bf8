//! Anchor DETR Model Configuration
//!
//! This module defines the configuration of the transformer detection head and the
//! string-backed option enums (`Activation`, `SpatialPrior`) it is built from.
//! Every name is parsed when the configuration is built, so an unknown option never
//! survives until the first forward pass.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors raised while building or validating a configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("activation should be relu/gelu/glu, not {0}")]
    UnknownActivation(String),

    #[error("unknown {0} spatial prior, expected learned or grid")]
    UnknownSpatialPrior(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Activation used inside the feed-forward blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Activation {
    Relu,
    Gelu,
    /// Gated linear unit: halves the hidden width, `a * sigmoid(b)`
    Glu,
}

impl Activation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Gelu => "gelu",
            Activation::Glu => "glu",
        }
    }
}

impl FromStr for Activation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relu" => Ok(Activation::Relu),
            "gelu" => Ok(Activation::Gelu),
            "glu" => Ok(Activation::Glu),
            other => Err(ConfigError::UnknownActivation(other.to_string())),
        }
    }
}

impl TryFrom<String> for Activation {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Activation> for String {
    fn from(value: Activation) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the reference points of the object queries are initialised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SpatialPrior {
    /// Embedding table `[num_position, 2]`, initialised uniformly in `[0, 1]`
    Learned,
    /// Fixed regular grid over `round(sqrt(num_position))^2` cells
    Grid,
}

impl SpatialPrior {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpatialPrior::Learned => "learned",
            SpatialPrior::Grid => "grid",
        }
    }
}

impl FromStr for SpatialPrior {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "learned" => Ok(SpatialPrior::Learned),
            "grid" => Ok(SpatialPrior::Grid),
            other => Err(ConfigError::UnknownSpatialPrior(other.to_string())),
        }
    }
}

impl TryFrom<String> for SpatialPrior {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SpatialPrior> for String {
    fn from(value: SpatialPrior) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SpatialPrior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the Anchor DETR transformer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorDetrConfig {
    /// Number of output classes (COCO = 91)
    pub num_classes: usize,
    /// Hidden dimension of the transformer
    pub d_model: usize,
    /// Number of attention heads (shared by every attention block)
    pub nhead: usize,
    /// Number of spatial self-attention encoder layers
    pub num_encoder_layers: usize,
    /// Number of decoder layers, which is also the number of predictions
    pub num_decoder_layers: usize,
    /// Hidden width of the feed-forward blocks
    pub dim_feedforward: usize,
    /// Dropout probability, only applied in training mode
    pub dropout: f32,
    /// Feed-forward activation
    pub activation: Activation,
    /// Number of anchor positions per pattern
    pub num_query_position: usize,
    /// Number of learned query patterns
    pub num_query_pattern: usize,
    /// Reference point initialisation
    pub spatial_prior: SpatialPrior,
    /// Temperature of the sinusoidal position embeddings
    pub temperature: f64,
}

impl Default for AnchorDetrConfig {
    fn default() -> Self {
        Self {
            num_classes: 91,
            d_model: 256,
            nhead: 8,
            num_encoder_layers: 6,
            num_decoder_layers: 6,
            dim_feedforward: 1024,
            dropout: 0.0,
            activation: Activation::Relu,
            num_query_position: 300,
            num_query_pattern: 3,
            spatial_prior: SpatialPrior::Learned,
            temperature: 10000.0,
        }
    }
}

impl AnchorDetrConfig {
    /// Load a configuration from a JSON file. Missing fields take their default value.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the numeric invariants the model relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.nhead == 0 || self.d_model % self.nhead != 0 {
            return invalid(format!(
                "d_model ({}) must be divisible by nhead ({})",
                self.d_model, self.nhead
            ));
        }
        // 2D embeddings use d_model / 2 interleaved sin/cos features per axis
        if self.d_model == 0 || self.d_model % 4 != 0 {
            return invalid(format!(
                "d_model ({}) must be a positive multiple of 4",
                self.d_model
            ));
        }
        if self.num_decoder_layers == 0 {
            return invalid("num_decoder_layers must be at least 1".to_string());
        }
        if self.num_classes == 0 {
            return invalid("num_classes must be at least 1".to_string());
        }
        if self.num_query_pattern == 0 || self.num_query_position == 0 {
            return invalid(format!(
                "num_query_pattern ({}) and num_query_position ({}) must be positive",
                self.num_query_pattern, self.num_query_position
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("dropout ({}) must be in [0, 1)", self.dropout));
        }
        if self.dim_feedforward == 0 {
            return invalid("dim_feedforward must be positive".to_string());
        }
        if self.activation == Activation::Glu && self.dim_feedforward % 2 != 0 {
            return invalid(format!(
                "glu needs an even dim_feedforward, got {}",
                self.dim_feedforward
            ));
        }
        if self.temperature <= 0.0 {
            return invalid(format!("temperature ({}) must be positive", self.temperature));
        }
        Ok(())
    }

    /// Number of positions actually used by the spatial prior.
    ///
    /// The grid prior rounds to the nearest perfect square, so 10 positions become 9.
    pub fn effective_num_position(&self) -> usize {
        match self.spatial_prior {
            SpatialPrior::Learned => self.num_query_position,
            SpatialPrior::Grid => {
                let side = grid_side(self.num_query_position);
                side * side
            }
        }
    }

    /// Query slots per image: `num_query_pattern * effective_num_position`
    pub fn num_queries(&self) -> usize {
        self.num_query_pattern * self.effective_num_position()
    }
}

/// Side of the square grid used for `num_position` anchors
pub(crate) fn grid_side(num_position: usize) -> usize {
    ((num_position as f64).sqrt().round() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_reference_constructor() {
        let config = AnchorDetrConfig::default();
        assert_eq!(config.d_model, 256);
        assert_eq!(config.dim_feedforward, 1024);
        assert_eq!(config.num_queries(), 900);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_activation_is_rejected() {
        let err = "swish".parse::<Activation>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownActivation(ref name) if name == "swish"));
        assert!(err.to_string().contains("swish"));
    }

    #[test]
    fn test_unknown_spatial_prior_in_json() {
        let err = serde_json::from_str::<AnchorDetrConfig>(r#"{"spatial_prior": "random"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("random"), "{}", err);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AnchorDetrConfig =
            serde_json::from_str(r#"{"num_classes": 3, "activation": "gelu"}"#).unwrap();
        assert_eq!(config.num_classes, 3);
        assert_eq!(config.activation, Activation::Gelu);
        assert_eq!(config.nhead, 8);

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""activation":"gelu""#));
        assert!(json.contains(r#""spatial_prior":"learned""#));
    }

    #[test]
    fn test_grid_rounds_to_square() {
        let config = AnchorDetrConfig {
            spatial_prior: SpatialPrior::Grid,
            num_query_position: 10,
            ..Default::default()
        };
        assert_eq!(config.effective_num_position(), 9);
        assert_eq!(config.num_queries(), 27);

        let learned = AnchorDetrConfig {
            num_query_position: 10,
            ..Default::default()
        };
        assert_eq!(learned.effective_num_position(), 10);
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let config = AnchorDetrConfig {
            nhead: 7,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = AnchorDetrConfig {
            activation: Activation::Glu,
            dim_feedforward: 33,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AnchorDetrConfig {
            dropout: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"d_model": 64, "nhead": 4, "spatial_prior": "grid"}}"#).unwrap();
        let config = AnchorDetrConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.d_model, 64);
        assert_eq!(config.spatial_prior, SpatialPrior::Grid);
    }
}
