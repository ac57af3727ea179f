//! Delta CLI - cognition core status tool
//!
//! Constructs the core against a model host and reports component status.
//! The interactive shell front-end wires the core the same way; this
//! binary exists for smoke-testing a host endpoint and inspecting state.

use clap::Parser;
use std::sync::Arc;

use delta::{ConfigStore, Core, Result};

#[derive(Parser, Debug)]
#[command(name = "delta-cli", version, about = "Delta cognition core status tool")]
struct Args {
    /// Model host endpoint
    #[arg(long, default_value = "http://localhost:11434")]
    endpoint: String,

    /// Model name for generation requests
    #[arg(long, default_value = "llama3.2:1b")]
    model: String,

    /// Probe the host and list its models
    #[arg(long)]
    probe: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = ConfigStore::default();
    config.set("model.endpoint", &args.endpoint)?;
    config.set("model.name", &args.model)?;
    let core = Core::new(Arc::new(config))?;

    println!("Delta cognition core v{}", delta::VERSION);
    println!("  endpoint: {}", args.endpoint);
    println!("  model:    {}", args.model);

    if args.probe {
        if core.client().available().await {
            let models = core.client().list_models().await?;
            println!("  host:     available ({} models)", models.len());
            for name in models {
                println!("            - {}", name);
            }
        } else {
            println!("  host:     unreachable");
        }
    }

    let stats = core.stats();
    println!("  enabled:  {}", stats.enabled);
    println!("  memory:   {} entries", stats.memory.current_entries);
    println!("  learner:  {} categories", stats.art2.population);
    println!("  training: {} pending examples", stats.training.pending);

    core.shutdown();
    Ok(())
}
