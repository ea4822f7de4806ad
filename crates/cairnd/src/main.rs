//! `cairnd`: the Cairn transparency log daemon.
//!
//! Administers logs in a local leaf store and runs the background
//! sequencer over them.
//!
//! # Usage
//!
//! ```text
//! cairnd init --log 1                       # create log 1
//! cairnd queue --log 1 alpha beta           # queue two leaves
//! cairnd sequence --log 1                   # integrate everything queued
//! cairnd root --log 1 --first 2             # latest root, proof from size 2
//! cairnd leaves --log 1 --start 0 -n 10     # read sequenced leaves
//! cairnd prove inclusion --log 1 --index 0  # inclusion proof, verified locally
//! cairnd prove consistency --log 1 1 2      # consistency proof between sizes
//! cairnd run                                # sequence all logs until Ctrl-C
//! cairnd run --memory --init 1              # throwaway in-memory node
//! ```

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cairn_log::{Ed25519Signer, LogService, LogServiceConfig, LogSigner};
use cairn_merkle::verify;
use cairn_store::{FjallLeafStore, LeafStore, MemoryLeafStore};
use cairn_types::{Leaf, LeafInput, LogId, LogSettings, NodeHash, SignedLogRoot, SystemTimeSource};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "cairnd", version, about = "Cairn transparency log daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override data directory.
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a log with an empty tree and a signed root for size 0.
    Init {
        /// Log identifier.
        #[arg(short, long)]
        log: i64,

        /// Accept repeated identities as new leaves.
        #[arg(long)]
        allow_duplicates: bool,
    },

    /// Queue leaves for sequencing.
    Queue {
        /// Log identifier.
        #[arg(short, long)]
        log: i64,

        /// Leaf values, one leaf each.
        #[arg(required = true)]
        values: Vec<String>,

        /// Values are hex-encoded bytes rather than text.
        #[arg(long)]
        hex: bool,

        /// Extra data stored with every leaf (not hashed).
        #[arg(long)]
        extra: Option<String>,

        /// Hex-encoded identity hash overriding the leaf hash for dedup.
        #[arg(long)]
        identity: Option<String>,
    },

    /// Integrate queued leaves now.
    Sequence {
        /// Log identifier. All logs when omitted.
        #[arg(short, long)]
        log: Option<i64>,
    },

    /// Show a signed root.
    Root {
        /// Log identifier.
        #[arg(short, long)]
        log: i64,

        /// Show the root signed for this exact size instead of the latest.
        #[arg(long, conflicts_with = "first")]
        size: Option<i64>,

        /// Include a consistency proof from this size to the latest root.
        #[arg(long)]
        first: Option<i64>,
    },

    /// List sequenced leaves.
    Leaves {
        /// Log identifier.
        #[arg(short, long)]
        log: i64,

        /// First leaf index.
        #[arg(long, default_value = "0")]
        start: i64,

        /// Number of leaves.
        #[arg(short = 'n', long, default_value = "10")]
        count: i64,
    },

    /// Produce and verify proofs.
    Prove {
        #[command(subcommand)]
        action: ProveCommands,
    },

    /// Run the background sequencer over all logs until interrupted.
    Run {
        /// Run fully in-memory (no disk persistence).
        #[arg(short, long)]
        memory: bool,

        /// Logs to create at startup if they do not exist.
        #[arg(long)]
        init: Vec<i64>,
    },

    /// Print the hex-encoded root signing public key.
    Pubkey,
}

#[derive(Subcommand)]
enum ProveCommands {
    /// Inclusion proof for a leaf, by index or by leaf hash.
    Inclusion {
        /// Log identifier.
        #[arg(short, long)]
        log: i64,

        /// Leaf index.
        #[arg(long, required_unless_present = "hash", conflicts_with = "hash")]
        index: Option<i64>,

        /// Hex-encoded Merkle leaf hash.
        #[arg(long)]
        hash: Option<String>,

        /// Signed tree size to prove against. Latest root when omitted.
        #[arg(long)]
        size: Option<i64>,
    },

    /// Consistency proof between two signed tree sizes.
    Consistency {
        /// Log identifier.
        #[arg(short, long)]
        log: i64,

        /// Earlier tree size.
        first: i64,

        /// Later tree size. Latest root when omitted.
        second: Option<i64>,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    // CLI args override config file values.
    if let Some(dir) = cli.data_dir {
        config.node.data_dir = dir;
    }
    if let Commands::Run { memory: true, .. } = cli.command {
        config.storage.backend = "memory".to_string();
    }

    let service = open_service(&config)?;

    match cli.command {
        Commands::Init {
            log,
            allow_duplicates,
        } => {
            let settings = LogSettings {
                allow_duplicates,
                hasher: config.tree.hasher,
            };
            cmd_init(&service, LogId::new(log), settings)
        }
        Commands::Queue {
            log,
            values,
            hex,
            extra,
            identity,
        } => {
            let inputs = parse_inputs(&values, hex, extra.as_deref(), identity.as_deref())?;
            cmd_queue(&service, LogId::new(log), inputs)
        }
        Commands::Sequence { log } => cmd_sequence(&service, log.map(LogId::new)).await,
        Commands::Root { log, size, first } => cmd_root(&service, LogId::new(log), size, first),
        Commands::Leaves { log, start, count } => {
            cmd_leaves(&service, LogId::new(log), start, count)
        }
        Commands::Prove { action } => match action {
            ProveCommands::Inclusion {
                log,
                index,
                hash,
                size,
            } => cmd_prove_inclusion(&service, LogId::new(log), index, hash.as_deref(), size),
            ProveCommands::Consistency { log, first, second } => {
                cmd_prove_consistency(&service, LogId::new(log), first, second)
            }
        },
        Commands::Run { init, .. } => {
            let settings = LogSettings {
                hasher: config.tree.hasher,
                ..LogSettings::default()
            };
            cmd_run(service, init, settings).await
        }
        Commands::Pubkey => {
            let signer = load_signer(&config)?;
            println!("{}", hex::encode(signer.public_key()));
            Ok(())
        }
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Build the log service for `config`: leaf store, signer and sequencer.
fn open_service(config: &CliConfig) -> Result<LogService> {
    let store: Arc<dyn LeafStore> = if config.is_memory() {
        info!("using in-memory leaf store");
        Arc::new(MemoryLeafStore::new())
    } else {
        std::fs::create_dir_all(&config.node.data_dir)
            .context("failed to create data directory")?;
        let path = config.store_path();
        Arc::new(FjallLeafStore::open(&path).context("failed to open leaf store")?)
    };

    let service_config = LogServiceConfig {
        sequencer: config.sequencer_config(),
    };
    Ok(LogService::new(
        service_config,
        store,
        Arc::new(load_signer(config)?),
        Arc::new(SystemTimeSource),
    ))
}

// -----------------------------------------------------------------------
// Key management
// -----------------------------------------------------------------------

/// The signer for `config`: ephemeral in memory mode unless a key path is
/// configured, persistent otherwise.
fn load_signer(config: &CliConfig) -> Result<Ed25519Signer> {
    if config.is_memory() && config.signer.key_path.is_none() {
        info!("generated ephemeral signing key (memory mode)");
        return Ok(Ed25519Signer::generate());
    }
    load_or_create_signer(&config.key_path())
}

/// Load or create a persistent Ed25519 signing key at `key_path`.
///
/// On first run, generates a new random key and writes its 32 secret bytes.
/// On subsequent runs, reads the existing key, so roots signed across
/// restarts verify under the same public key.
fn load_or_create_signer(key_path: &Path) -> Result<Ed25519Signer> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).context("failed to read signing key")?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("signing key must be exactly 32 bytes"))?;
        let signer = Ed25519Signer::from_bytes(&secret);
        info!(
            public_key = %hex::encode(signer.public_key()),
            "loaded existing signing key"
        );
        Ok(signer)
    } else {
        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create key directory")?;
        }
        let signer = Ed25519Signer::generate();
        std::fs::write(key_path, signer.to_bytes()).context("failed to write signing key")?;
        info!(
            path = %key_path.display(),
            public_key = %hex::encode(signer.public_key()),
            "generated new signing key"
        );
        Ok(signer)
    }
}

// -----------------------------------------------------------------------
// Input parsing
// -----------------------------------------------------------------------

fn parse_inputs(
    values: &[String],
    hex_values: bool,
    extra: Option<&str>,
    identity: Option<&str>,
) -> Result<Vec<LeafInput>> {
    let identity = identity
        .map(|h| hex::decode(h).context("identity must be hex"))
        .transpose()?;

    values
        .iter()
        .map(|value| {
            let bytes = if hex_values {
                hex::decode(value).with_context(|| format!("leaf value {value:?} is not hex"))?
            } else {
                value.as_bytes().to_vec()
            };
            let mut input = LeafInput::new(bytes);
            if let Some(extra) = extra {
                input = input.with_extra(extra.as_bytes());
            }
            if let Some(identity) = &identity {
                input = input.with_identity(identity.clone());
            }
            Ok(input)
        })
        .collect()
}

// -----------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------

fn cmd_init(service: &LogService, log_id: LogId, settings: LogSettings) -> Result<()> {
    let root = service.init_log(log_id, settings)?;
    println!("Initialized log {log_id}");
    print_root(&root);
    Ok(())
}

fn cmd_queue(service: &LogService, log_id: LogId, inputs: Vec<LeafInput>) -> Result<()> {
    let outcomes = service.queue_leaves(log_id, inputs)?;
    for outcome in outcomes {
        match outcome {
            Ok(outcome) => println!(
                "{:?} {} {}",
                outcome.status,
                outcome.leaf.merkle_hash,
                describe_index(&outcome.leaf)
            ),
            Err(e) => println!("Rejected: {e}"),
        }
    }
    Ok(())
}

async fn cmd_sequence(service: &LogService, log_id: Option<LogId>) -> Result<()> {
    let logs = match log_id {
        Some(log_id) => vec![log_id],
        None => service.list_logs()?,
    };

    for log_id in logs {
        let mut total = 0;
        loop {
            let report = service.sequence(log_id).await?;
            if report.lease_denied {
                println!("Log {log_id}: sequencing lease held by another process");
                break;
            }
            total += report.leaves;
            if report.leaves == 0 {
                println!(
                    "Log {log_id}: integrated {total} leaves, size {} revision {}",
                    report.new_size, report.revision
                );
                break;
            }
        }
    }
    Ok(())
}

fn cmd_root(
    service: &LogService,
    log_id: LogId,
    size: Option<i64>,
    first: Option<i64>,
) -> Result<()> {
    if let Some(size) = size {
        print_root(&service.get_signed_root_at_size(log_id, size)?);
        return Ok(());
    }

    let latest = service.get_latest_signed_root(log_id, first)?;
    print_root(&latest.root);
    if let Some(proof) = latest.consistency {
        println!("Consistency proof ({} hashes):", proof.hashes.len());
        for hash in &proof.hashes {
            println!("  {hash}");
        }
    }
    Ok(())
}

fn cmd_leaves(service: &LogService, log_id: LogId, start: i64, count: i64) -> Result<()> {
    let leaves = service.get_leaves_by_range(log_id, start, count)?;
    for leaf in &leaves {
        println!(
            "{} {} {}",
            describe_index(leaf),
            leaf.merkle_hash,
            String::from_utf8_lossy(&leaf.value)
        );
    }
    println!("{} of {} leaves", leaves.len(), service.get_sequenced_leaf_count(log_id)?);
    Ok(())
}

fn cmd_prove_inclusion(
    service: &LogService,
    log_id: LogId,
    index: Option<i64>,
    hash: Option<&str>,
    size: Option<i64>,
) -> Result<()> {
    let root = target_root(service, log_id, size)?;
    let tree_size = root.tree_size as i64;

    let leaves = match (index, hash) {
        (Some(index), _) => {
            let entry = service.get_entry_and_proof(log_id, index, tree_size)?;
            vec![(entry.leaf.merkle_hash, entry.proof)]
        }
        (None, Some(hash)) => {
            let bytes = hex::decode(hash).context("leaf hash must be hex")?;
            let proofs = service.get_inclusion_proof_by_hash(log_id, &bytes, tree_size)?;
            let leaf_hash = NodeHash::from_slice(&bytes)
                .context("leaf hash must be 32 bytes")?;
            proofs.into_iter().map(|p| (leaf_hash, p)).collect()
        }
        (None, None) => anyhow::bail!("either --index or --hash is required"),
    };

    print_root(&root);
    let hasher = service.log_hasher(log_id)?;
    for (leaf_hash, proof) in leaves {
        verify::verify_inclusion(
            hasher.as_ref(),
            proof.leaf_index,
            root.tree_size,
            &leaf_hash,
            &proof.hashes,
            &root.root_hash,
        )
        .context("inclusion proof failed to verify")?;

        println!(
            "Leaf {} ({leaf_hash}), {} hashes, verified:",
            proof.leaf_index,
            proof.hashes.len()
        );
        for hash in &proof.hashes {
            println!("  {hash}");
        }
    }
    Ok(())
}

fn cmd_prove_consistency(
    service: &LogService,
    log_id: LogId,
    first: i64,
    second: Option<i64>,
) -> Result<()> {
    let second_root = target_root(service, log_id, second)?;
    let first_root = service.get_signed_root_at_size(log_id, first)?;
    let proof = service.get_consistency_proof(log_id, first, second_root.tree_size as i64)?;

    verify::verify_consistency(
        service.log_hasher(log_id)?.as_ref(),
        first_root.tree_size,
        second_root.tree_size,
        &proof.hashes,
        &first_root.root_hash,
        &second_root.root_hash,
    )
    .context("consistency proof failed to verify")?;

    println!(
        "Sizes {} -> {}, {} hashes, verified:",
        first_root.tree_size,
        second_root.tree_size,
        proof.hashes.len()
    );
    for hash in &proof.hashes {
        println!("  {hash}");
    }
    Ok(())
}

/// Run the background sequencer; logs in `init` that do not exist yet are
/// created with `settings`.
async fn cmd_run(service: LogService, init: Vec<i64>, settings: LogSettings) -> Result<()> {
    for log in init {
        let log_id = LogId::new(log);
        if service.list_logs()?.contains(&log_id) {
            continue;
        }
        service.init_log(log_id, settings)?;
    }
    for log_id in service.list_logs()? {
        let kind = service.store().log_settings(log_id)?.hasher;
        if kind != settings.hasher {
            warn!(
                %log_id,
                log_hasher = %kind,
                configured = %settings.hasher,
                "log keeps the hasher it was initialized with"
            );
        }
    }

    let config = service.sequencer().config();
    info!(
        logs = service.list_logs()?.len(),
        batch_size = config.batch_size,
        interval_ms = config.interval.as_millis() as u64,
        "starting cairnd"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sequencer = service.spawn_sequencer(shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    sequencer.await.context("sequencer task failed")?;
    Ok(())
}

// -----------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------

/// The signed root for `size`, or the latest one.
fn target_root(service: &LogService, log_id: LogId, size: Option<i64>) -> Result<SignedLogRoot> {
    Ok(match size {
        Some(size) => service.get_signed_root_at_size(log_id, size)?,
        None => service.get_latest_signed_root(log_id, None)?.root,
    })
}

fn describe_index(leaf: &Leaf) -> String {
    match leaf.index {
        Some(index) => format!("#{index}"),
        None => "(queued)".to_string(),
    }
}

fn print_root(root: &SignedLogRoot) {
    println!(
        "Log {} size={} revision={} timestamp={} root={}",
        root.log_id, root.tree_size, root.revision, root.timestamp_nanos, root.root_hash
    );
    println!("  signature={}", hex::encode(&root.signature));
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
