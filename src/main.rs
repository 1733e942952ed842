use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::debug;

use pipewright::config::Config;
use pipewright::core::PipelineId;
use pipewright::healing;
use pipewright::Result;

/// pipewright - agent coordination core for ETL pipelines
#[derive(Parser, Debug)]
#[command(name = "pipewright")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    PIPEWRIGHT_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.pipewright/pipewright.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Configuration file (defaults to ~/.pipewright/pipewright.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the effective configuration as TOML
    Config,

    /// Check the configuration file and exit
    Validate,

    /// Print the retry schedule of the effective error-handling policy
    Backoff {
        /// Use the overrides of this pipeline
        #[arg(long)]
        pipeline: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    pipewright::log::init_with_debug(cli.debug);

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let config = load_config(cli.config.as_deref())?;
    debug!(?command, "running command");
    match command {
        Command::Config => print!("{}", toml::to_string_pretty(&config)?),
        Command::Validate => {
            config.validate()?;
            println!(
                "configuration ok: {} agent(s), {} pipeline override(s)",
                config.agents.len(),
                config.pipelines.len()
            );
        }
        Command::Backoff { pipeline } => run_backoff(&config, pipeline),
    }
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn run_backoff(config: &Config, pipeline: Option<String>) {
    let policy = match &pipeline {
        Some(id) => config.policy_for(&PipelineId::from(id.as_str())),
        None => config.error_handling.clone(),
    };
    let label = pipeline.as_deref().unwrap_or("default policy");
    println!(
        "{label}: {} attempt(s), base {}, cap {}",
        policy.max_attempts,
        format_delay(policy.base_backoff()),
        format_delay(policy.max_backoff())
    );
    for (i, delay) in healing::schedule(&policy).iter().enumerate() {
        println!("  attempt {:>2}  wait {}", i + 1, format_delay(*delay));
    }
    println!("  then escalate");
}

fn format_delay(delay: Duration) -> String {
    if delay.as_millis() >= 1000 && delay.as_millis() % 1000 == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{}ms", delay.as_millis())
    }
}
