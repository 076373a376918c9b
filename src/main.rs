//! Trigger probe
//!
//! Opens the configured trigger device, waits for the start of the run and
//! prints every following trigger relative to it. Lines typed on stdin are
//! fed to the keyboard layer as key names, so `5` emulates a sync key and
//! `escape` aborts.

use anyhow::{Context, Result};
use clap::Parser;
use scanner_trigger::config::AppConfig;
use scanner_trigger::registry::{self, Collaborators};
use scanner_trigger::{Clock, KeyQueue, MonotonicClock};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scanner_trigger", about = "Wait for MRI scanner triggers")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config/scanner_trigger.toml")]
    config: PathBuf,

    /// Override the configured port type
    #[arg(short, long)]
    port_type: Option<String>,

    /// Triggers to skip before the run starts (dummy scans)
    #[arg(short, long)]
    skip: Option<u32>,

    /// Triggers to report after the run has started
    #[arg(short = 'n', long, default_value_t = 10)]
    count: u32,

    /// List the registered port types and exit
    #[arg(long)]
    list: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.list {
        for port_type in registry::registered_port_types() {
            println!("{}", port_type);
        }
        return Ok(());
    }

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting {}", config.application.name);

    let keys = KeyQueue::shared();
    spawn_stdin_keys(keys.clone());

    let clock = MonotonicClock::shared();
    let port_type = cli.port_type.unwrap_or(config.trigger.port_type.clone());
    let skip = cli.skip.unwrap_or(config.trigger.skip);

    let mut trigger = registry::create(
        &port_type,
        clock.clone(),
        &config.trigger.factory_input(),
        Collaborators::new(keys),
    )
    .with_context(|| format!("Failed to create trigger '{}'", port_type))?;
    trigger.open().context("Failed to open trigger")?;
    info!(settings = %trigger.backend_settings(), "Using {}", trigger.describe());

    trigger
        .wait_for_trigger(skip)
        .context("Run did not start")?;
    clock.reset();
    println!("run started (trigger {})", trigger.trigger_count());

    for _ in 0..cli.count {
        trigger.wait_for_trigger(0).context("Waiting for trigger failed")?;
        println!(
            "trigger {}\t{:.6}",
            trigger.trigger_count(),
            trigger.last_trigger_time().as_secs_f64()
        );
    }

    trigger.close()?;
    Ok(())
}

fn spawn_stdin_keys(keys: Arc<KeyQueue>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    let key = line.trim();
                    if !key.is_empty() {
                        keys.push(key);
                    }
                }
                Err(e) => {
                    warn!("Stopped reading keys from stdin: {}", e);
                    break;
                }
            }
        }
    });
}
