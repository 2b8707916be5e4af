//! DAG inspection CLI
//!
//! Read-only inspection of a SQLite DAG store: list and show transactions,
//! dump payloads, print heads, walk in clock order and summarize the store.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use trustdag_core::{logging, Hash, StorageConfig};
use trustdag_crypto::StaticKeyResolver;
use trustdag_dag::{
    DagError, DagStore, SigningKeyRef, SqliteEngine, StoreHealth, StoreStatistics, Transaction,
    VerifierPipeline,
};

#[derive(Parser, Debug)]
#[command(name = "dag-cli", version, about = "Inspect a TrustDAG store")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, value_name = "PATH")]
    db: PathBuf,

    /// Emit JSON instead of human-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all transactions in clock order
    List,
    /// Show one transaction
    Show {
        /// Transaction ref (hex)
        reference: String,
    },
    /// Write a transaction's payload to stdout
    Payload {
        /// Transaction ref (hex)
        reference: String,
    },
    /// Print the current heads
    Heads,
    /// Walk transactions in clock order
    Walk {
        /// First Lamport clock to visit
        #[arg(long, default_value_t = 0)]
        from: u32,
    },
    /// Print store statistics
    Stats,
}

/// JSON output for a single transaction
#[derive(Debug, Serialize)]
struct TransactionOutput {
    reference: Hash,
    lamport_clock: u32,
    payload_type: String,
    payload_hash: Hash,
    prevs: Vec<Hash>,
    algorithm: String,
    signing_time: u64,
    key_id: Option<String>,
    embedded_key: bool,
    document: String,
}

impl From<&Transaction> for TransactionOutput {
    fn from(transaction: &Transaction) -> Self {
        let (key_id, embedded_key) = match transaction.signing_key() {
            SigningKeyRef::ById(key_id) => (Some(key_id.clone()), false),
            SigningKeyRef::Embedded(_) => (None, true),
        };
        Self {
            reference: transaction.reference(),
            lamport_clock: transaction.lamport_clock(),
            payload_type: transaction.payload_type().to_string(),
            payload_hash: transaction.payload_hash(),
            prevs: transaction.prevs().to_vec(),
            algorithm: transaction.algorithm().to_string(),
            signing_time: transaction.signing_time(),
            key_id,
            embedded_key,
            document: transaction.as_str().to_string(),
        }
    }
}

type Store = DagStore<SqliteEngine>;

fn open_store(path: &Path) -> anyhow::Result<Store> {
    let engine = SqliteEngine::open_read_only(path, &StorageConfig::default())
        .with_context(|| format!("Failed to open {}", path.display()))?;
    // Inspection never adds, so no keys are needed
    let pipeline = VerifierPipeline::new(Arc::new(StaticKeyResolver::new()));
    Ok(DagStore::new(engine, pipeline))
}

fn parse_reference(reference: &str) -> anyhow::Result<Hash> {
    Hash::parse_hex(reference).with_context(|| format!("Invalid transaction ref {}", reference))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_line(transaction: &Transaction) {
    println!(
        "{:>6}  {}  {}",
        transaction.lamport_clock(),
        transaction.reference(),
        transaction.payload_type()
    );
}

fn cmd_list(store: &Store, json: bool) -> anyhow::Result<()> {
    cmd_walk(store, 0, json)
}

fn cmd_show(store: &Store, reference: &str, json: bool) -> anyhow::Result<()> {
    let transaction = store.get_transaction(&parse_reference(reference)?)?;
    let output = TransactionOutput::from(&transaction);

    if json {
        return print_json(&output);
    }

    println!("Ref:           {}", output.reference);
    println!("Lamport clock: {}", output.lamport_clock);
    println!("Payload type:  {}", output.payload_type);
    println!("Payload hash:  {}", output.payload_hash);
    println!("Algorithm:     {}", output.algorithm);
    println!("Signing time:  {}", output.signing_time);
    match &output.key_id {
        Some(key_id) => println!("Key ID:        {}", key_id),
        None => println!("Key:           embedded JWK"),
    }
    if output.prevs.is_empty() {
        println!("Prevs:         (root)");
    }
    for prev in &output.prevs {
        println!("Prev:          {}", prev);
    }
    Ok(())
}

fn cmd_payload(store: &Store, reference: &str) -> anyhow::Result<()> {
    let reference = parse_reference(reference)?;
    let payload = match store.get_payload(&reference) {
        Ok(payload) => payload,
        Err(DagError::PayloadNotReceived { .. }) => {
            bail!("Transaction {} has no payload yet", reference)
        }
        Err(e) => return Err(e.into()),
    };
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&payload)?;
    stdout.flush()?;
    Ok(())
}

fn cmd_heads(store: &Store, json: bool) -> anyhow::Result<()> {
    let parents = store.head_parents()?;
    if json {
        #[derive(Serialize)]
        struct HeadOutput {
            reference: Hash,
            lamport_clock: u32,
        }
        let heads: Vec<HeadOutput> = parents
            .iter()
            .map(|p| HeadOutput {
                reference: p.reference,
                lamport_clock: p.lamport_clock,
            })
            .collect();
        return print_json(&heads);
    }

    for parent in parents {
        println!("{:>6}  {}", parent.lamport_clock, parent.reference);
    }
    Ok(())
}

fn cmd_walk(store: &Store, from: u32, json: bool) -> anyhow::Result<()> {
    let mut outputs = Vec::new();
    let visited = store.walk(from, &CancellationToken::new(), |transaction| {
        if json {
            outputs.push(TransactionOutput::from(transaction));
        } else {
            print_line(transaction);
        }
        true
    })?;

    if json {
        print_json(&outputs)
    } else {
        eprintln!("{} transaction(s)", visited);
        Ok(())
    }
}

fn cmd_stats(store: &Store, json: bool) -> anyhow::Result<()> {
    let statistics = store.statistics()?;
    let health = store.integrity_check()?;

    if json {
        #[derive(Serialize)]
        struct StatsOutput<'a> {
            #[serde(flatten)]
            statistics: &'a StoreStatistics,
            health: StoreHealth,
        }
        return print_json(&StatsOutput {
            statistics: &statistics,
            health,
        });
    }

    println!("Transactions:      {}", statistics.transaction_count);
    println!("Payloads:          {}", statistics.payload_count);
    println!("Heads:             {}", statistics.heads.len());
    match statistics.max_lamport_clock {
        Some(clock) => println!("Max Lamport clock: {}", clock),
        None => println!("Max Lamport clock: -"),
    }
    match health {
        StoreHealth::Ok => println!("Integrity:         ok"),
        StoreHealth::Corrupted { reason } => {
            println!("Integrity:         CORRUPTED ({})", reason)
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_cli("warn");

    let store = open_store(&cli.db)?;
    match cli.command {
        Command::List => cmd_list(&store, cli.json),
        Command::Show { reference } => cmd_show(&store, &reference, cli.json),
        Command::Payload { reference } => cmd_payload(&store, &reference),
        Command::Heads => cmd_heads(&store, cli.json),
        Command::Walk { from } => cmd_walk(&store, from, cli.json),
        Command::Stats => cmd_stats(&store, cli.json),
    }
}
