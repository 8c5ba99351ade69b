//! ctabs - Custom Tabs connection inspector
//!
//! Prints the effective configuration and replays declarative client
//! scenarios against a connection wired to in-memory collaborators.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use custom_tabs_core::config::{Config, LogFormat, resolve_config_path};
use custom_tabs_core::error::{ConfigError, Error as CoreError};
use custom_tabs_core::logging::init_logging;

mod scenario;

use scenario::Scenario;

/// ctabs - Custom Tabs connection inspector
#[derive(Parser, Debug)]
#[command(name = "ctabs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults to $CTABS_CONFIG, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Replay a JSON client scenario, printing one JSON line per step
    Replay {
        /// Scenario file ("-" reads stdin)
        scenario: PathBuf,

        /// Print a summary line after the last step
        #[arg(long)]
        summary: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration
    Show {
        #[arg(long, value_enum, default_value_t = OutputFormat::Toml)]
        format: OutputFormat,
    },

    /// Print which config file would be loaded
    Path,

    /// Load and validate a config file without starting anything
    Check {
        /// File to check (defaults to the resolved config path)
        file: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Toml,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("Error: {err:#}");
        if let Some(remediation) = remediation_for(&err) {
            eprint!("{remediation}");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if cli.log_json {
        config.logging.format = LogFormat::Json;
    }

    match cli.command {
        Commands::Config(ConfigCommands::Show { format }) => {
            let rendered = match format {
                OutputFormat::Toml => config.to_toml_string()?,
                OutputFormat::Json => serde_json::to_string_pretty(&config)?,
            };
            println!("{}", rendered.trim_end());
        }
        Commands::Config(ConfigCommands::Path) => {
            match resolve_config_path(cli.config.as_deref()) {
                Some(path) => println!("{}", path.display()),
                None => println!("(none, using defaults)"),
            }
        }
        Commands::Config(ConfigCommands::Check { file }) => {
            let path = file
                .or_else(|| resolve_config_path(cli.config.as_deref()))
                .context("no config file to check")?;
            Config::load(&path)?;
            println!("{}: ok", path.display());
        }
        Commands::Replay { scenario, summary } => {
            init_logging(&config.logging).context("failed to initialize logging")?;
            let scenario = read_scenario(&scenario)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let result = scenario::replay(&scenario, &config, &mut out).await?;
            if summary {
                serde_json::to_writer(&mut out, &serde_json::json!({ "summary": result }))?;
                writeln!(out)?;
            }
            out.flush()?;
        }
    }
    Ok(())
}

fn read_scenario(path: &Path) -> Result<Scenario> {
    let content = if path == Path::new("-") {
        io::read_to_string(io::stdin()).context("failed to read scenario from stdin")?
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?
    };
    Scenario::from_json(&content)
}

fn remediation_for(err: &anyhow::Error) -> Option<String> {
    if let Some(err) = err.downcast_ref::<ConfigError>() {
        return Some(err.remediation().render_plain());
    }
    err.downcast_ref::<CoreError>()
        .and_then(CoreError::remediation)
        .map(|remediation| remediation.render_plain())
}
