use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nci_core::HalConfig;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the engine test suite
    Test,
    /// Run clippy with warnings denied
    Lint,
    /// Validate a HAL configuration file
    CheckConfig { path: PathBuf },
    /// Write the default HAL configuration
    DefaultConfig {
        #[arg(default_value = "nci-hal.toml")]
        path: PathBuf,
    },
}

fn cargo(args: &[&str]) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("cargo {} failed", args.join(" "));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build", "--workspace"])?;
        }
        Commands::Test => {
            println!("Testing nci-core...");
            cargo(&["test", "-p", "nci-core"])?;
        }
        Commands::Lint => {
            println!("Linting...");
            cargo(&["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
        }
        Commands::CheckConfig { path } => {
            let config = HalConfig::load_from_file(path)?;
            println!(
                "{}: ok ({} RF blocks, {} core parameters, retransmission {})",
                path.display(),
                config.rf_blocks.len(),
                config.core_conf.len(),
                if config.retransmission.enabled { "on" } else { "off" }
            );
        }
        Commands::DefaultConfig { path } => {
            HalConfig::default()
                .save_to_file(path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
    }

    Ok(())
}
