//! Anchor DETR detection head with Candle
//!
//! A transformer head that turns multi-level CNN features and padding masks into
//! per-layer class logits and normalized boxes, using row/column decoupled attention
//! and anchor-point object queries.

pub mod config;
pub mod datasets;
pub mod model;
pub mod utils;

pub use crate::config::{Activation, AnchorDetrConfig, ConfigError, SpatialPrior};
pub use crate::datasets::{register_custom_datasets, DatasetCatalog, DatasetError};
pub use crate::model::{init_transformer, Transformer, TransformerOutput};
