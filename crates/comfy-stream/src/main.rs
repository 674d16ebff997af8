use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stream_pipeline::{
    timesteps::{DEFAULT_TOTAL_STEPS, DEFAULT_TURBO_STEPS},
    Settings,
};
use tracing::metadata::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod commands;
mod settings;

/// Plan and inspect StreamDiffusion pipelines driven by ComfyUI workflows.
#[derive(Parser, Debug)]
#[command(name = "comfy-stream")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Additional configuration file, merged over config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the timestep indices chosen for the given sampling settings
    Indices {
        /// Number of denoising steps
        #[arg(short, long, default_value_t = 4)]
        steps: u32,

        /// Denoising strength between 0 and 1
        #[arg(short, long, default_value_t = 0.6)]
        denoise: f32,

        /// Length of the full schedule
        #[arg(long, default_value_t = DEFAULT_TOTAL_STEPS)]
        total_steps: u32,

        /// Model name, used to detect turbo models
        #[arg(short, long)]
        model: Option<String>,

        /// Step count selecting the turbo timestep table
        #[arg(long, default_value_t = DEFAULT_TURBO_STEPS)]
        turbo_steps: u32,
    },

    /// Print the engine configuration derived from the configuration
    Plan {
        /// ComfyUI workflow (API format) to take the model, LoRA and sampler settings from
        #[arg(short, long)]
        workflow: Option<PathBuf>,
    },

    /// Print the parameters extracted from a ComfyUI workflow
    Workflow {
        /// Workflow file in API format
        path: PathBuf,

        /// Start from this node instead of the workflow's output node
        #[arg(short, long)]
        output_node: Option<String>,
    },

    /// List the LoRA presets
    Presets,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env()
        .context("Failed to parse filter from env")?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .pretty()
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let load_settings = || -> anyhow::Result<Settings> {
        settings::figment(cli.config.as_deref())
            .extract()
            .context("Invalid configuration")
    };

    let output = match &cli.command {
        Commands::Indices {
            steps,
            denoise,
            total_steps,
            model,
            turbo_steps,
        } => commands::indices(
            *steps,
            *denoise,
            *total_steps,
            model.as_deref(),
            *turbo_steps,
        )?,
        Commands::Plan { workflow } => commands::plan(load_settings()?, workflow.as_deref())?,
        Commands::Workflow { path, output_node } => {
            commands::workflow(path, output_node.as_deref())?
        }
        Commands::Presets => commands::presets(&load_settings()?)?,
    };
    println!("{output}");

    Ok(())
}
