//! SDXL LoRA fine-tuning on a folder of product photos
//!
//! Usage: train_lora --dataset ./photos --output ./lora --epochs 10 --rank 8

use adgen::device::select_device;
use adgen::trainers::{LoraTrainer, SdxlComponentLoader, TrainingOptions};
use adgen::{load_config, Config};
use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train an SDXL LoRA adapter")]
struct Args {
    /// Directory of images with optional `.txt` caption sidecars
    #[arg(long)]
    dataset: PathBuf,

    /// Where the adapter weights and config are written
    #[arg(long)]
    output: PathBuf,

    #[arg(long, default_value_t = 1)]
    epochs: usize,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    #[arg(long, default_value_t = 4)]
    rank: usize,

    /// Training configuration YAML (base model paths, learning rate, ...)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Device to use (auto, cpu, cuda:0, metal)
    #[arg(long)]
    device: Option<String>,

    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    adgen::logging::init_logger();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    let mut options = TrainingOptions::from_config(
        &config.training,
        &args.dataset,
        &args.output,
        args.epochs,
        args.batch_size,
        args.rank,
    );
    if let Some(lr) = args.lr {
        info!("Overriding learning rate: {}", lr);
        options.learning_rate = lr;
    }
    if args.seed.is_some() {
        options.seed = args.seed;
    }

    let device = select_device(args.device.as_deref().unwrap_or(&config.device))?;
    info!(
        "Training rank {} LoRA for {} epoch(s), batch size {}, lr {}",
        options.rank, options.epochs, options.batch_size, options.learning_rate
    );

    let loader = SdxlComponentLoader::new(config.training.base_model.clone());
    let run = match LoraTrainer::new(options).run(&loader, &device) {
        Ok(run) => run,
        Err(e) => {
            eprintln!("{}", serde_json::to_string_pretty(&e.report())?);
            std::process::exit(1);
        }
    };

    info!(
        "Adapter saved to {} ({} layers, {} steps, final loss {})",
        run.adapter.path.display(),
        run.adapter.layers,
        run.steps,
        run.adapter
            .final_loss
            .map(|l| format!("{:.4}", l))
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}
