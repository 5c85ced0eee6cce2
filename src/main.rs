//! meshckpt CLI - Sharded checkpoint tooling for mesh-parallel transformers
//!
//! Inspect, validate, and reshard checkpoints without loading the full
//! unsharded model into memory.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use meshckpt::{
    utils::{dtype_name, human_bytes},
    ArchConfig, CheckpointReader, Location, Manifest, PartitionPlan, PartitionRule, Resharder,
    ShardStore,
};

#[derive(Parser)]
#[command(name = "meshckpt")]
#[command(author, version, about = "Sharded checkpoint toolkit for mesh-parallel models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show information about a checkpoint
    Info {
        /// Checkpoint location (directory or https:// URL)
        location: String,

        /// Architecture config JSON (required for legacy checkpoints)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the partition table for a config at a given shard count
    Plan {
        /// Architecture config JSON
        #[arg(short, long)]
        config: PathBuf,

        /// Shard count to lay the parameters out for
        #[arg(short, long, default_value = "1")]
        shards: usize,
    },

    /// Rewrite a checkpoint to a different shard count
    Reshard {
        /// Source checkpoint location (directory or https:// URL)
        source: String,

        /// Destination directory
        dest: PathBuf,

        /// Destination shard count
        #[arg(short, long)]
        shards: usize,

        /// Architecture config JSON (required for legacy sources)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Check a checkpoint's archives against its architecture
    Validate {
        /// Checkpoint location (directory or https:// URL)
        location: String,

        /// Architecture config JSON (required for legacy checkpoints)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshckpt=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { location, config } => {
            info(&location, config.as_deref()).await?;
        }

        Commands::Plan { config, shards } => {
            plan(&config, shards)?;
        }

        Commands::Reshard {
            source,
            dest,
            shards,
            config,
        } => {
            reshard(&source, &dest, shards, config.as_deref()).await?;
        }

        Commands::Validate { location, config } => {
            validate(&location, config.as_deref()).await?;
        }
    }

    Ok(())
}

/// Cache directory for remote checkpoints
fn cache_dir() -> PathBuf {
    std::env::var("MESHCKPT_CACHE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(".cache/meshckpt")
        })
}

async fn open_source(location: &str) -> anyhow::Result<std::sync::Arc<dyn ShardStore>> {
    let location = Location::parse(location)?;
    Ok(location.open_readonly(&cache_dir()).await?)
}

/// Resolve the effective config: the manifest's embedded one, or the
/// caller's file for legacy checkpoints.
fn effective_config(
    manifest: &Manifest,
    config_path: Option<&std::path::Path>,
) -> anyhow::Result<ArchConfig> {
    match (&manifest.arch, config_path) {
        (Some(embedded), _) => Ok(embedded.clone()),
        (None, Some(path)) => Ok(ArchConfig::from_file(path)?),
        (None, None) => anyhow::bail!(
            "legacy checkpoint has no embedded architecture; pass --config"
        ),
    }
}

fn rule_name(rule: &PartitionRule) -> String {
    match rule {
        PartitionRule::Replicate => "replicate".to_string(),
        PartitionRule::Split { axis } => format!("split(axis {})", axis),
    }
}

async fn info(location: &str, config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let store = open_source(location).await?;
    let manifest = Manifest::load(store.as_ref())?;
    let config = effective_config(&manifest, config_path)?;
    let plan = PartitionPlan::for_config(&config)?;

    println!("Checkpoint Information");
    println!("======================");
    println!("Location: {}", store.location());
    println!(
        "Format version: {}{}",
        manifest.format_version,
        if manifest.is_legacy() { " (legacy)" } else { "" }
    );
    println!("Shards: {}", manifest.shard_count);
    println!("Compat: {:?}", config.compat);
    println!("Layers: {}", config.n_layers);
    println!("Model dim: {}", config.d_model);
    println!("Heads: {} x {}", config.n_heads, config.d_head);
    println!(
        "Vocab: {} (+{} padding)",
        config.n_vocab, config.n_vocab_padding
    );
    println!("Dtype: {}", dtype_name(plan.dtype()));

    let total = plan.total_parameters();
    let bytes = total * plan.dtype().size_in_bytes();
    println!("Tensors: {}", plan.len());
    println!(
        "Parameters: {} ({} unsharded, ~{} per shard)",
        total,
        human_bytes(bytes as u64),
        human_bytes((bytes / manifest.shard_count) as u64)
    );

    Ok(())
}

fn plan(config_path: &std::path::Path, shards: usize) -> anyhow::Result<()> {
    let config = ArchConfig::from_file(config_path)?;
    let plan = PartitionPlan::for_config(&config)?;
    plan.validate_shard_count(shards)?;

    println!(
        "{:<40} {:<18} {:<16} {}",
        "TENSOR", "SHAPE", "RULE", "PER-SHARD"
    );
    for spec in plan.iter() {
        let per_shard = spec.shard_shape(shards)?;
        println!(
            "{:<40} {:<18} {:<16} {:?}",
            spec.path.as_str(),
            format!("{:?}", spec.shape),
            rule_name(&spec.rule),
            per_shard
        );
    }

    let total = plan.total_parameters();
    println!(
        "\n{} tensors, {} parameters, {} per shard at {} shards",
        plan.len(),
        total,
        human_bytes((total * plan.dtype().size_in_bytes() / shards) as u64),
        shards
    );
    Ok(())
}

async fn reshard(
    source: &str,
    dest: &std::path::Path,
    shards: usize,
    config_path: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let source_store = open_source(source).await?;
    let dest_store = Location::Local(dest.to_path_buf()).open_writable()?;

    let config = match config_path {
        Some(path) => Some(ArchConfig::from_file(path)?),
        None => None,
    };

    let resharder = Resharder::new(source_store, dest_store);
    let manifest = resharder.reshard(config.as_ref(), shards)?;

    println!(
        "Resharded to {} shards at {}",
        manifest.shard_count,
        dest.display()
    );
    Ok(())
}

async fn validate(location: &str, config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let store = open_source(location).await?;
    let manifest = Manifest::load(store.as_ref())?;
    let config = effective_config(&manifest, config_path)?;

    // Revalidates the embedded arch against the partition plan and the
    // stored shard count.
    let reader = CheckpointReader::new(store.clone(), &config);
    let manifest = reader.manifest()?;

    // Check every archive's headers against the plan without reading any
    // tensor bytes.
    let plan = PartitionPlan::for_config(&config)?;
    let mut problems = 0usize;
    for (index, name) in manifest.shard_files.iter().enumerate() {
        let archive = store.open_archive(name)?;
        for spec in plan.iter() {
            let expected = spec.shard_shape(manifest.shard_count)?;
            match archive.tensor_info(spec.path.as_str()) {
                Ok(info) if info.shape == expected => {}
                Ok(info) => {
                    problems += 1;
                    println!(
                        "shard {}: {} has shape {:?}, expected {:?}",
                        index, spec.path, info.shape, expected
                    );
                }
                Err(_) => {
                    problems += 1;
                    println!("shard {}: {} missing", index, spec.path);
                }
            }
        }
    }

    if problems == 0 {
        println!(
            "OK: {} shards, {} tensors each",
            manifest.shard_count,
            plan.len()
        );
        Ok(())
    } else {
        anyhow::bail!("{} problems found", problems)
    }
}
