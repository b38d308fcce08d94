use anyhow::Context;
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;

use shardkv_core::observability::init_tracing;
use shardkv_core::shardctrler::rebalance::rebalance;
use shardkv_core::types::NO_GROUP;
use shardkv_core::{GroupId, LogBackend, Settings, NSHARDS};

mod demo;

#[derive(Parser)]
#[command(name = "shardkv")]
#[command(about = "Sharded key/value store with a replicated shard controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run a scripted workload against an in-process deployment and verify it
    Demo {
        /// Settings file (TOML); defaults are used when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Replicated log backend ("memory" or "raft")
        #[arg(long)]
        backend: Option<String>,

        /// Number of keys written by the workload
        #[arg(long, default_value = "20")]
        keys: usize,
    },
    /// Print the shard assignment the controller computes for a set of groups
    Rebalance {
        /// Group ids joining an empty deployment
        #[arg(required = true)]
        gids: Vec<GroupId>,
    },
    /// Load, validate and print a settings file
    CheckConfig {
        path: PathBuf,
    },
}

fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<Settings> {
    match path {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("loading settings from {}", path.display())),
        None => {
            let mut settings = Settings::default();
            settings.apply_env_overrides()?;
            settings.validate()?;
            Ok(settings)
        }
    }
}

fn parse_backend(name: &str) -> anyhow::Result<LogBackend> {
    match name.to_ascii_lowercase().as_str() {
        "memory" => Ok(LogBackend::Memory),
        "raft" => Ok(LogBackend::Raft),
        other => anyhow::bail!("unknown backend: {}", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            config,
            backend,
            keys,
        } => {
            let mut settings = load_settings(config.as_ref())?;
            if let Some(backend) = backend {
                settings.log.backend = parse_backend(&backend)?;
            }
            init_tracing(&settings.observability.log_level);

            let report = demo::run(settings, keys).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Rebalance { gids } => {
            let groups: BTreeMap<GroupId, Vec<String>> =
                gids.iter().map(|gid| (*gid, Vec::new())).collect();
            let mut shards = [NO_GROUP; NSHARDS];
            rebalance(&mut shards, &groups);

            let mut assignment: BTreeMap<GroupId, Vec<usize>> = BTreeMap::new();
            for (shard, gid) in shards.iter().enumerate() {
                assignment.entry(*gid).or_default().push(shard);
            }
            println!("{}", serde_json::to_string_pretty(&assignment)?);
        }
        Commands::CheckConfig { path } => {
            let settings = load_settings(Some(&path))?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}
