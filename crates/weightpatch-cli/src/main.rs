//! weightpatch CLI
//!
//! Inspect adapter files and resolve merged parameter values from the
//! command line.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

mod commands;

use commands::{ConfigAction, KeysCommand, RankCommand, ResolveCommand};
use weightpatch_common::WeightPatchConfig;

/// weightpatch - adapter weight resolution toolkit
#[derive(Parser)]
#[command(name = "weightpatch")]
#[command(about = "Adapter rank inspection and weight resolution")]
#[command(long_about = r#"
Resolve model parameters from a base weight file plus a set of low-rank
adapter files, either merged densely or as concatenated factors.

Examples:
  # Total rank of a set of adapters
  weightpatch rank style.safetensors detail.safetensors

  # Modules touched by the adapters
  weightpatch keys style.safetensors --model-file base.safetensors

  # Resolve one parameter against an adapter list
  weightpatch resolve --base base.safetensors --adapters adapters.toml \
      --name "__unet__[t-12-0]" --shape 320,320
"#)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "PATH", global = true, env = "WEIGHTPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true, default_value = "warn")]
    log_level: String,

    /// Log format (pretty, compact, json)
    #[arg(long, value_name = "FORMAT", global = true, default_value = "compact")]
    log_format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Report the summed rank of adapter files
    Rank(RankCommand),

    /// List module identifiers touched by adapter files
    Keys(KeysCommand),

    /// Resolve one parameter from a base file and adapters
    Resolve(ResolveCommand),

    /// Show or generate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, &cli.log_format);

    let result = load_configuration(cli.config.as_deref()).and_then(|config| match cli.command {
        Some(Commands::Rank(cmd)) => cmd.execute(&config),
        Some(Commands::Keys(cmd)) => cmd.execute(&config),
        Some(Commands::Resolve(cmd)) => cmd.execute(&config),
        Some(Commands::Config { action }) => action.execute(&config),
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            Ok(())
        }
    });

    if let Err(e) = result {
        error!("Command failed: {e}");
        eprintln!("error: {e}");
        for cause in e.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
        std::process::exit(1);
    }

    Ok(())
}

/// Load the configuration file if one was given, otherwise defaults plus
/// environment overrides.
fn load_configuration(path: Option<&std::path::Path>) -> Result<WeightPatchConfig> {
    match path {
        Some(path) => WeightPatchConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => WeightPatchConfig::from_env().context("Invalid WEIGHTPATCH_* environment"),
    }
}

/// Install the tracing subscriber. `RUST_LOG` wins over `--log-level`.
fn setup_logging(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "pretty" => subscriber.pretty().init(),
        _ => subscriber.compact().init(),
    }
}
