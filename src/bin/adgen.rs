//! Product ad generation from the command line
//!
//! Usage: adgen [--config adgen.yaml] generate --image product.jpg --style street

use adgen::device::DeviceLease;
use adgen::imaging::{AspectRatio, VerticalAlignment};
use adgen::inference::shared_from_config;
use adgen::pipeline::OutputFormat;
use adgen::styles::synthesize_prompt;
use adgen::trainers::captions::DEFAULT_TRIGGER_WORD;
use adgen::trainers::generate_captions;
use adgen::{load_config, Config, GenerationRequest, Orchestrator};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Styled advertising images from product photos")]
struct Cli {
    /// YAML configuration; built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full generation pipeline on one product photo
    Generate {
        #[arg(long)]
        image: PathBuf,

        #[arg(long, default_value = "minimal")]
        style: String,

        /// square, portrait or landscape
        #[arg(long, default_value = "square")]
        ratio: String,

        #[arg(long)]
        prompt: Option<String>,

        #[arg(long)]
        negative: Option<String>,

        #[arg(long)]
        steps: Option<usize>,

        /// Control-signal weight in [0, 2]; the style's default when omitted
        #[arg(long)]
        scale: Option<f32>,

        /// Fraction of the canvas the product may occupy
        #[arg(long)]
        padding: Option<f64>,

        /// top, center or bottom
        #[arg(long, default_value = "center")]
        align: String,

        /// Send the composed canvas as an appearance reference
        #[arg(long)]
        identity: bool,

        #[arg(long)]
        seed: Option<u64>,

        /// jpeg or png; the configured default when omitted
        #[arg(long)]
        format: Option<String>,

        /// Write the encoded image here
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print the prompt pair for a style, or a synthesised category prompt
    Style {
        key: String,

        /// Synthesise a prompt for this product category instead
        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        base_style: Option<String>,
    },

    /// Write caption sidecars for images that lack one
    Caption {
        dir: PathBuf,

        #[arg(long, default_value = DEFAULT_TRIGGER_WORD)]
        trigger: String,
    },
}

fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_config(path)
        }
        None => Ok(Config::default()),
    }
}

fn main() -> Result<()> {
    adgen::logging::init_logger();
    let cli = Cli::parse();
    let config = load(cli.config.as_deref())?;

    match cli.command {
        Command::Generate {
            image,
            style,
            ratio,
            prompt,
            negative,
            steps,
            scale,
            padding,
            align,
            identity,
            seed,
            format,
            out,
        } => {
            let bytes = fs::read(&image).with_context(|| format!("Failed to read {}", image.display()))?;
            let mut request = GenerationRequest::new(bytes)
                .style(style)
                .aspect_ratio(AspectRatio::resolve(&ratio))
                .identity_conditioning(identity);
            request.prompt_extra = prompt;
            request.negative_prompt_extra = negative;
            request.inference_steps = steps.unwrap_or(config.generation.steps);
            request.conditioning_scale = scale;
            request.padding_percent = padding.unwrap_or(config.generation.padding);
            request.vertical_alignment = align.parse::<VerticalAlignment>()?;
            request.seed = seed;
            request.output_format = format.as_deref().map(str::parse::<OutputFormat>).transpose()?;

            let inference = Arc::new(shared_from_config(&config.inference, &config.device, DeviceLease::new()));
            let orchestrator = Orchestrator::from_config(&config, inference)?;

            let result = match orchestrator.generate(&request) {
                Ok(result) => result,
                Err(e) => {
                    eprintln!("{}", serde_json::to_string_pretty(&e.report())?);
                    std::process::exit(1);
                }
            };

            if let Some(out) = out {
                fs::write(&out, &result.bytes).with_context(|| format!("Failed to write {}", out.display()))?;
                info!("Wrote {} ({} bytes)", out.display(), result.bytes.len());
            }
            println!("{}", serde_json::to_string_pretty(&result.summary())?);
        }

        Command::Style {
            key,
            category,
            base_style,
        } => {
            let output = match category {
                Some(category) => serde_json::json!({
                    "category": category,
                    "prompt": synthesize_prompt(&category, base_style.as_deref()),
                }),
                None => {
                    let registry = adgen::StyleRegistry::with_profiles(&config.styles)?;
                    let resolved = registry.resolve_key(&key);
                    serde_json::json!({
                        "style": resolved,
                        "prompts": registry.resolve_prompt_pair(resolved, None, None),
                        "conditioning_scale": registry.get_profile(resolved).conditioning_scale,
                    })
                }
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Command::Caption { dir, trigger } => {
            let written = generate_captions(&dir, &trigger)?;
            info!("Wrote {} caption files in {}", written, dir.display());
        }
    }

    Ok(())
}
