use std::io::{IsTerminal, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use holo_debug::check_store::{self, CheckStoreConfig};
use holo_debug::dump::{self, KeysConfig};
use holo_debug::recovery::{self, RecoveryConfig};
use holo_store::records::{RangeId, StoreId};
use holo_store::state::load_range_descriptor;
use holo_store::{FjallEngine, OpenOptions};

#[derive(Parser)]
#[command(name = "holo-debug")]
#[command(about = "Offline inspection and repair of a HoloStore store directory", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check raft state and MVCC stats of every range; exits non-zero on any violation.
    CheckStore {
        /// Store directory.
        dir: PathBuf,
    },
    /// Make the local replica the only member of ranges whose other replicas are all dead.
    UnsafeRemoveDeadReplicas {
        /// Comma-separated ids of stores that are permanently lost.
        #[arg(
            long,
            env = "HOLO_DEAD_STORE_IDS",
            value_delimiter = ',',
            required = true
        )]
        dead_store_ids: Vec<StoreId>,
        /// Store directory.
        dir: PathBuf,
    },
    /// Print every key of the store.
    Keys {
        dir: PathBuf,
        /// Decode and print values.
        #[arg(long, default_value_t = false)]
        values: bool,
        /// Print encoded key and value sizes.
        #[arg(long, default_value_t = false)]
        sizes: bool,
        /// First key to print.
        #[arg(long)]
        start: Option<String>,
        /// Key to stop before.
        #[arg(long)]
        end: Option<String>,
        /// Interpret --start and --end as hex bytes (no 0x prefix).
        #[arg(long, default_value_t = false)]
        hex: bool,
    },
    /// Print every version of every range descriptor.
    RangeDescriptors { dir: PathBuf },
    /// Print the raft log of one range.
    RaftLog {
        dir: PathBuf,
        #[arg(value_parser = dump::parse_range_id)]
        range_id: RangeId,
    },
    /// Print all data held by one replica.
    RangeData {
        dir: PathBuf,
        #[arg(value_parser = dump::parse_range_id)]
        range_id: RangeId,
        /// Only the replicated part of the replica's data.
        #[arg(long, default_value_t = false)]
        replicated: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    let mut stdout = std::io::stdout().lock();
    match args.command {
        Command::CheckStore { dir } => {
            check_store::run(&CheckStoreConfig { dir }, &mut stdout)?;
        }
        Command::UnsafeRemoveDeadReplicas {
            dead_store_ids,
            dir,
        } => {
            let cfg = RecoveryConfig::new(dir, dead_store_ids)?;
            recovery::run(&cfg, &mut stdout)?;
        }
        Command::Keys {
            dir,
            values,
            sizes,
            start,
            end,
            hex,
        } => {
            let cfg = KeysConfig {
                values,
                sizes,
                start: start.map(|s| dump::parse_key(&s, hex)).transpose()?,
                end: end.map(|s| dump::parse_key(&s, hex)).transpose()?,
            };
            let engine = FjallEngine::open(&dir, OpenOptions::read_only())?;
            dump::keys(&engine, &cfg, &mut stdout)?;
        }
        Command::RangeDescriptors { dir } => {
            let engine = FjallEngine::open(&dir, OpenOptions::read_only())?;
            dump::range_descriptors(&engine, &mut stdout)?;
        }
        Command::RaftLog { dir, range_id } => {
            let engine = FjallEngine::open(&dir, OpenOptions::read_only())?;
            dump::raft_log(&engine, range_id, &mut stdout)?;
        }
        Command::RangeData {
            dir,
            range_id,
            replicated,
        } => {
            let engine = FjallEngine::open(&dir, OpenOptions::read_only())?;
            let desc = load_range_descriptor(&engine, range_id)?;
            dump::range_data(&engine, &desc, replicated, &mut stdout)?;
        }
    }
    stdout.flush()?;
    Ok(())
}
