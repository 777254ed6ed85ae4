//! CLI Entry Point for bart_bridge
//!
//! Provides command-line interface for:
//! - Running one reconstruction stage over CFL files
//! - Checking a command script without executing it
//!
//! # Usage
//!
//! Reconstruct:
//! ```bash
//! bart_bridge --config bridge.toml run kspace recon
//! bart_bridge run kspace recon --reference calib --script-name pics.sh
//! ```
//!
//! Check a script:
//! ```bash
//! bart_bridge check-script /usr/local/share/gadgetron/bart/pics.sh --json
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

use bart_bridge::config::BridgeConfig;
use bart_bridge::engine::Engine;
use bart_bridge::logging::{self, LoggingConfig};
use bart_bridge::orchestrator::PipelineArray;
use bart_bridge::remap::PipelineShape;
use bart_bridge::script::{substitute_parameters, tokenize, Script};
use bart_bridge::{cfl, ReconStage, StageInput};

#[derive(Parser)]
#[command(name = "bart_bridge")]
#[command(about = "Run BART command scripts on in-memory pipeline data", long_about = None)]
struct Cli {
    /// Configuration file (TOML); BART_BRIDGE_* environment variables override it
    #[arg(long, global = true, default_value = "bart_bridge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct one CFL array with the configured script
    Run {
        /// Base name of the input CFL (without .hdr/.cfl)
        input: PathBuf,

        /// Base name of the output CFL
        output: PathBuf,

        /// Base name of a separate calibration scan
        #[arg(long)]
        reference: Option<PathBuf>,

        /// Override the configured script name
        #[arg(long)]
        script_name: Option<String>,

        /// Use the in-process mock engine instead of BART
        #[arg(long)]
        mock: bool,
    },

    /// Parse a script and print the commands it would run
    CheckScript {
        /// Script file
        script: PathBuf,

        /// Print the commands as a JSON array
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BridgeConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    logging::init(LoggingConfig::from_settings(&config.logging)?)?;

    match cli.command {
        Commands::Run {
            input,
            output,
            reference,
            script_name,
            mock,
        } => {
            if let Some(name) = script_name {
                config.stage.script_name = name;
            }
            config.validate()?;
            if mock {
                let engine = bart_bridge::engine::mock::MockEngine::new();
                run(config, engine, &input, &output, reference.as_deref())
            } else {
                run_bart(config, &input, &output, reference.as_deref())
            }
        }
        Commands::CheckScript { script, json } => check_script(&config, &script, json),
    }
}

#[cfg(feature = "bart_ffi")]
fn run_bart(config: BridgeConfig, input: &Path, output: &Path, reference: Option<&Path>) -> Result<()> {
    run(config, bart_bridge::engine::ffi::FfiEngine::new(), input, output, reference)
}

#[cfg(not(feature = "bart_ffi"))]
fn run_bart(_: BridgeConfig, _: &Path, _: &Path, _: Option<&Path>) -> Result<()> {
    bail!("built without the `bart_ffi` feature; pass --mock or rebuild with --features bart_ffi")
}

fn load_pipeline(base: &Path) -> Result<(PipelineShape, Vec<num_complex::Complex32>)> {
    let (dims, data) = cfl::read_cfl(base).with_context(|| format!("reading {}", base.display()))?;
    let shape = PipelineShape::from_dims(&dims)
        .with_context(|| format!("{} is not a 7-axis pipeline array", base.display()))?;
    Ok((shape, data))
}

fn run<E: Engine>(
    config: BridgeConfig,
    engine: E,
    input: &Path,
    output: &Path,
    reference: Option<&Path>,
) -> Result<()> {
    let (shape, mut data) = load_pipeline(input)?;
    let mut reference = reference.map(load_pipeline).transpose()?;

    let mut stage = ReconStage::new(config, engine)?;
    info!(engine = stage.engine().name(), %shape, "starting reconstruction");
    let result = stage.process(StageInput {
        data: PipelineArray {
            shape,
            data: &mut data,
        },
        reference: reference.as_mut().map(|(shape, data)| PipelineArray {
            shape: *shape,
            data,
        }),
        parameters: None,
    })?;

    cfl::write_cfl(output, result.shape.as_slice(), &result.data)
        .with_context(|| format!("writing {}", output.display()))?;
    info!(shape = %result.shape, series = result.image_series, output = %output.display(), "done");
    Ok(())
}

fn check_script(config: &BridgeConfig, path: &Path, json: bool) -> Result<()> {
    let script = Script::from_file(path, &config.stage.command_prefix)?;
    if script.is_empty() {
        bail!("{} contains no '{}' command lines", path.display(), config.stage.command_prefix);
    }

    let mut commands = Vec::with_capacity(script.len());
    for line in script.lines() {
        let expanded = substitute_parameters(&line.text, &config.parameters)
            .with_context(|| format!("line {}", line.number))?;
        let request = tokenize(&expanded, config.stage.output_capacity)
            .with_context(|| format!("line {}", line.number))?;
        commands.push(request.to_string());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&commands)?);
    } else {
        for command in &commands {
            println!("{command}");
        }
    }
    Ok(())
}
