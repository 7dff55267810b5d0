use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address of the broker.
    #[arg(short, long, env = "ADDR", default_value = "127.0.0.1:2097")]
    pub(crate) addr: String,
    /// Milliseconds to wait for each reply.
    #[arg(short, long, default_value_t = 1000)]
    pub(crate) timeout_ms: u64,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Checks the broker is up and prints the round-trip time.
    Ping,
    /// Puts a job, or merges it into the job with the same ID.
    Put {
        queue: String,
        id: String,
        content: String,
        /// Higher priorities are reserved first.
        #[arg(short, long, default_value_t = 0.0)]
        priority: f64,
        /// Time (RFC 3339) before which the job can't be reserved.
        #[arg(long, conflicts_with = "hold_for")]
        hold_until: Option<DateTime<Utc>>,
        /// Seconds from now before which the job can't be reserved.
        #[arg(long)]
        hold_for: Option<u64>,
        /// Seconds a reservation holds the job for.
        #[arg(long, default_value_t = 300)]
        ttr: u64,
    },
    /// Reserves the highest-priority job that's ready.
    Reserve {
        queue: String,
        /// Keep trying until a job is ready.
        #[arg(short, long, default_value_t)]
        wait: bool,
    },
    /// Shows the job `reserve` would reserve, without reserving it.
    Peek { queue: String },
    /// Deletes a job.
    Delete { queue: String, id: String },
    /// Shows job counts for a queue.
    Stats { queue: String },
}
