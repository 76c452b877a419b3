use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing::{info, warn};

use super::CliStore;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Role {
    Reader,
    Incrementer,
}

#[derive(clap::Args)]
pub struct StressOpts {
    #[clap(long, value_enum)]
    role: Role,
    #[clap(long)]
    key: String,
    #[clap(long, default_value_t = 5000)]
    reps: u64,
}

/// Runs the workload until `reps` operations are done or a termination
/// signal arrives. Signals are only looked at between operations, so a lock
/// is never left held.
pub fn run(store: &mut CliStore, opts: &StressOpts) -> Result<(), Box<dyn Error>> {
    let closing = Arc::new(AtomicBool::new(false));
    for signal in [SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&closing))?;
    }

    let start = Instant::now();
    let mut done = 0u64;
    while done < opts.reps {
        if closing.load(Ordering::Relaxed) {
            warn!(done, reps = opts.reps, "stopped by signal");
            break;
        }
        match opts.role {
            Role::Reader => {
                store.get(&opts.key)?;
            }
            Role::Incrementer => {
                store.adjust(opts.key.clone(), |v| v.unwrap_or(0) + 1)?;
            }
        }
        done += 1;
    }

    let elapsed = start.elapsed();
    info!(role = ?opts.role, key = %opts.key, done, ?elapsed, "stress run finished");
    println!("{}", done);
    Ok(())
}
