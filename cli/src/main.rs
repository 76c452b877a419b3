use std::error::Error;

use clap::{self, Parser};
use tracing::info_span;
use tracing_subscriber::EnvFilter;

use syncstore::{unlink_primitives, FileStore, StoreConfig};

mod stress;

type CliStore = FileStore<String, i64>;

#[derive(clap::Parser)]
#[clap(name = "syncstore", about = "Key-value store shared by processes through one file")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "syncstore.toml")]
    config: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Remove the named lock primitives
    Unlink,
    #[clap(flatten)]
    Store(StoreCommand),
}

#[derive(clap::Subcommand)]
enum StoreCommand {
    /// Print the value of KEY
    Get { key: String },
    /// Set KEY to VALUE
    Set {
        key: String,
        #[clap(allow_hyphen_values = true)]
        value: i64,
    },
    /// Remove KEY and print the value it had
    Delete { key: String },
    /// Add to the value of KEY, an absent key counting as 0
    Incr {
        key: String,
        #[clap(long, default_value_t = 1, allow_hyphen_values = true)]
        by: i64,
    },
    /// Print the store file and its content
    Describe,
    /// Print the whole store as JSON
    Dump,
    /// Set keys 1..=COUNT to key * STEP
    Seed {
        #[clap(long, default_value_t = 50)]
        count: i64,
        #[clap(long, default_value_t = 100)]
        step: i64,
    },
    /// Repeat reads or increments of one key
    Stress(stress::StressOpts),
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .init();

    let config: StoreConfig = confy::load_path(&opts.config)?;
    let span = info_span!("syncstore", pid = std::process::id());

    match opts.command {
        // Opening a store would create the segment that is to be removed.
        Command::Unlink => println!("{}", unlink_primitives(&config.lock)?),
        Command::Store(command) => {
            let mut store = CliStore::open(&config, span)?;
            run(&mut store, command)?;
        }
    }
    Ok(())
}

fn run(store: &mut CliStore, command: StoreCommand) -> Result<(), Box<dyn Error>> {
    match command {
        StoreCommand::Get { key } => print_optional(store.get(&key)?),
        StoreCommand::Set { key, value } => println!("{}", store.set(key, value)?),
        StoreCommand::Delete { key } => print_optional(store.delete(&key)?),
        StoreCommand::Incr { key, by } => println!("{}", store.adjust(key, |v| v.unwrap_or(0) + by)?),
        StoreCommand::Describe => println!("{}", store.describe()?),
        StoreCommand::Dump => println!("{}", serde_json::to_string_pretty(&store.snapshot()?)?),
        StoreCommand::Seed { count, step } => {
            for k in 1..=count {
                store.set(k.to_string(), k * step)?;
            }
            println!("{}", count);
        }
        StoreCommand::Stress(stress_opts) => stress::run(store, &stress_opts)?,
    }
    Ok(())
}

fn print_optional(value: Option<i64>) {
    match value {
        Some(v) => println!("{}", v),
        None => println!("(absent)"),
    }
}
