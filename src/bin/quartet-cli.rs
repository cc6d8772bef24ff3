//! Quartet CLI - initialize a runtime root, drive a journaled counter
//! service, and inspect journals

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use quartet::runtime::journal::{FileJournal, JournalStore};
use quartet::runtime::storage::Storage;
use quartet::{JournalMode, MethodDef, MethodTable, Runtime, RuntimeConfig, args};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "quartet")]
#[command(about = "Actor-style dispatch runtime with journaled replay", long_about = None)]
struct Cli {
    /// Root directory for runtime storage
    #[arg(short, long, default_value = ".quartet")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum JournalArg {
    Disabled,
    Memory,
    File,
}

impl From<JournalArg> for JournalMode {
    fn from(arg: JournalArg) -> Self {
        match arg {
            JournalArg::Disabled => JournalMode::Disabled,
            JournalArg::Memory => JournalMode::Memory,
            JournalArg::File => JournalMode::File,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new runtime root
    Init {
        /// Journal backend
        #[arg(long, value_enum, default_value = "file")]
        journal: JournalArg,

        /// Most messages per batch
        #[arg(long, default_value = "64")]
        max_batch: usize,

        /// Journal entries between automatic checkpoints
        #[arg(long, default_value = "1024")]
        save_interval: u64,
    },

    /// Show runtime status
    Status,

    /// Drive the demo counter service
    Counter {
        #[command(subcommand)]
        action: CounterAction,
    },

    /// Inspect journals
    Journal {
        #[command(subcommand)]
        action: JournalAction,
    },
}

#[derive(Subcommand)]
enum CounterAction {
    /// Add to the counter
    Add {
        /// Amount to add
        #[arg(allow_negative_numbers = true)]
        amount: i64,
    },
    /// Print the counter
    Get,
}

#[derive(Subcommand)]
enum JournalAction {
    /// Print the entries stored under a journal key
    Dump {
        /// Journal key (service name for root stubs)
        key: String,
    },
    /// Truncate torn tails left by a crash
    Repair,
}

#[derive(Default)]
struct Counter {
    value: i64,
}

fn counter_table() -> anyhow::Result<Arc<MethodTable>> {
    let table = MethodTable::builder::<Counter>()
        .method(
            MethodDef::send("add", |counter: &mut Counter, args| {
                counter.value += args.get::<i64>(0)?;
                Ok(())
            })
            .modify()
            .arity(1),
        )
        .method(MethodDef::query("get", |counter: &mut Counter, _| Ok(counter.value)))
        .build()?;
    Ok(table)
}

/// Runtime whose journal is always file-backed, so counter runs replay
fn counter_runtime(root: PathBuf) -> anyhow::Result<Runtime> {
    let config = quartet::runtime::storage::load_config(&root)
        .with_context(|| format!("no runtime at {}; run `init` first", root.display()))?;
    let journal = FileJournal::open(Storage::new(config.root.clone()))?;
    Ok(Runtime::with_journal(config, Arc::new(journal))?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            journal,
            max_batch,
            save_interval,
        } => {
            let config = RuntimeConfig {
                root: cli.root.clone(),
                journal: journal.into(),
                max_batch,
                save_interval,
                ..RuntimeConfig::default()
            };
            Runtime::init(config).context("initializing runtime")?;
            println!("Initialized runtime at {:?}", cli.root);
        }

        Commands::Status => {
            let runtime = Runtime::load(cli.root.clone()).context("loading runtime")?;
            let config = runtime.config();
            println!("Storage root: {:?}", runtime.storage().root());
            println!("Journal: {:?}", config.journal);
            println!("Max batch: {}", config.max_batch);
            println!("Save interval: {}", config.save_interval);
            let logs = runtime
                .storage()
                .list_dir(&runtime.storage().journal_dir(), "log")?;
            println!("Journal logs: {}", logs.len());
        }

        Commands::Counter { action } => {
            let runtime = counter_runtime(cli.root)?;
            let counter = runtime
                .service("counter", Counter::default(), counter_table()?)
                .start()?;
            if let CounterAction::Add { amount } = action {
                counter.query("add", args![amount]).await?;
            }
            // Offered after the add ran, so it lands in a later batch and the
            // add's journal entry has been flushed.
            let value: i64 = counter.query_as("get", args![]).await?;
            println!("counter = {value}");
        }

        Commands::Journal { action } => {
            let journal = FileJournal::open(Storage::new(cli.root.clone())).context("opening journal")?;
            match action {
                JournalAction::Dump { key } => {
                    let entries = journal.read(&key)?;
                    for entry in &entries {
                        println!("{}", serde_json::to_string(entry)?);
                    }
                    println!("{} entries", entries.len());
                }
                JournalAction::Repair => {
                    let repaired = journal.repair_all()?;
                    for path in &repaired {
                        println!("repaired {}", path.display());
                    }
                    println!("{} logs repaired", repaired.len());
                }
            }
        }
    }

    Ok(())
}
