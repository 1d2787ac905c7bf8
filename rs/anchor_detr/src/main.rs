//! Anchor DETR with Candle
//!
//! This binary inspects configurations and datasets and runs the transformer head on
//! synthetic features.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use anchor_detr::utils::{device, TensorStats};
use anchor_detr::{
    init_transformer, register_custom_datasets, AnchorDetrConfig, DatasetCatalog, Transformer,
};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the default configuration as JSON.
    Config {
        /// Write to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// List the custom datasets, optionally loading one of them.
    Datasets {
        /// Directory holding the dataset folders.
        #[arg(long, default_value = "./datasets")]
        root: PathBuf,

        /// Dataset to load and summarize.
        #[arg(long)]
        name: Option<String>,
    },

    /// Run one forward pass on synthetic features.
    Forward {
        /// Configuration file, in JSON format.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Path to model weights, in safetensors format. Fresh parameters when omitted.
        #[arg(long)]
        weights: Option<PathBuf>,

        #[arg(long, default_value_t = 2)]
        batch: usize,

        #[arg(long, default_value_t = 1)]
        levels: usize,

        #[arg(long, default_value_t = 16)]
        height: usize,

        #[arg(long, default_value_t = 20)]
        width: usize,

        /// Number of padded columns on the right of every image.
        #[arg(long, default_value_t = 4)]
        pad_right: usize,

        /// Run on CPU rather than on GPU.
        #[arg(long)]
        cpu: bool,
    },
}

/// Deterministic features `[b, l, c, h, w]` and a right-padded mask `[b, h, w]`
fn synthetic_inputs(
    shape: (usize, usize, usize, usize, usize),
    pad_right: usize,
    device: &Device,
) -> anyhow::Result<(Tensor, Tensor)> {
    let (b, l, c, h, w) = shape;
    let numel = (b * l * c * h * w) as u32;
    let srcs = (Tensor::arange(0u32, numel, device)?.to_dtype(DType::F32)? * 0.01)?
        .sin()?
        .reshape((b, l, c, h, w))?;

    let row: Vec<u8> = (0..w).map(|x| u8::from(x >= w - pad_right)).collect();
    let mask = Tensor::new(row.as_slice(), device)?
        .reshape((1, 1, w))?
        .repeat((b, h, 1))?;
    Ok((srcs, mask))
}

fn run_config(output: Option<PathBuf>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&AnchorDetrConfig::default())?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)?;
            log::info!("Default configuration written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn run_datasets(root: PathBuf, name: Option<String>) -> anyhow::Result<()> {
    let mut catalog = DatasetCatalog::new();
    register_custom_datasets(&mut catalog, &root)?;
    log::info!("{} datasets registered under {}", catalog.len(), root.display());

    for dataset in catalog.names() {
        let instances = catalog.get(dataset)?;
        println!(
            "{:<16} {} ({})",
            dataset,
            instances.json_file.display(),
            instances.image_root.display()
        );
    }

    if let Some(name) = name {
        let loaded = catalog.load(&name)?;
        println!(
            "{}: {} images, {} annotations, classes {:?}",
            name,
            loaded.records.len(),
            loaded.num_annotations(),
            loaded.thing_classes
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_forward(
    config: Option<PathBuf>,
    weights: Option<PathBuf>,
    batch: usize,
    levels: usize,
    height: usize,
    width: usize,
    pad_right: usize,
    cpu: bool,
) -> anyhow::Result<()> {
    if pad_right >= width {
        anyhow::bail!("pad-right ({}) must leave at least one valid column of {}", pad_right, width);
    }
    let device = device(cpu)?;
    log::info!("Using device: {:?}", device);

    let config = match config {
        Some(path) => AnchorDetrConfig::from_json_file(path)?,
        None => AnchorDetrConfig::default(),
    };
    log::info!(
        "Model config: d_model {}, heads {}, encoder/decoder layers {}/{}, {} classes",
        config.d_model,
        config.nhead,
        config.num_encoder_layers,
        config.num_decoder_layers,
        config.num_classes
    );

    let model = match weights {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Model weights not found at {:?}", path);
            }
            log::info!("Loading model from: {:?}", path);
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)? };
            Transformer::load(&config, vb)?
        }
        None => init_transformer(&config, DType::F32, &device)?.0,
    };

    let (srcs, mask) = synthetic_inputs(
        (batch, levels, config.d_model, height, width),
        pad_right,
        &device,
    )?;
    log::info!("Input features {:?}, mask {:?}", srcs.dims(), mask.dims());

    let start = std::time::Instant::now();
    let output = model.forward(&srcs, &[mask], false)?;
    log::info!("Forward pass took {:?}", start.elapsed());

    log::info!("class_logits {}", TensorStats::from_tensor(&output.class_logits)?);
    log::info!("boxes {}", TensorStats::from_tensor(&output.boxes)?);

    let (logits, boxes) = output.last_layer()?;
    let scores = candle_nn::ops::sigmoid(&logits)?.max(candle_core::D::Minus1)?;
    log::info!("last layer scores {}", TensorStats::from_tensor(&scores)?);
    log::info!("last layer boxes {}", TensorStats::from_tensor(&boxes)?);
    Ok(())
}

pub fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Config { output } => run_config(output),
        Command::Datasets { root, name } => run_datasets(root, name),
        Command::Forward {
            config,
            weights,
            batch,
            levels,
            height,
            width,
            pad_right,
            cpu,
        } => run_forward(config, weights, batch, levels, height, width, pad_right, cpu),
    }
}
