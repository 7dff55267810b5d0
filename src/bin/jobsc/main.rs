mod args;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use datagram_jobs::{Client, ClientError, Job};
use serde::Serialize;
use tracing::{error, Level};

use crate::args::{Args, Command};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging goes to stderr so it never mixes with command output.
    tracing_subscriber::fmt()
        .with_max_level(Level::WARN)
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = begin(args).await {
        error!(error = %format!("{error:#}"), "command failed");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn begin(args: Args) -> Result<()> {
    let client = Client::connect(&args.addr)
        .await
        .with_context(|| format!("connecting to {}", args.addr))?
        .with_timeout(Duration::from_millis(args.timeout_ms));

    match args.command {
        Command::Ping => {
            let rtt = client.ping().await.context("ping")?;
            println!("pong in {rtt:?}");
        },
        Command::Put {
            queue,
            id,
            content,
            priority,
            hold_until,
            hold_for,
            ttr,
        } => {
            let mut job = Job::new(queue, id, content)
                .with_priority(priority)
                .with_ttr(Duration::from_secs(ttr));
            if let Some(hold_until) = hold_until {
                job = job.with_hold_until(hold_until);
            } else if let Some(secs) = hold_for {
                let secs = i64::try_from(secs).context("--hold-for")?;
                job.hold_until = Utc::now().timestamp().saturating_add(secs);
            }

            let action = client.put(&job).await.context("put")?;
            println!("{action}");
        },
        Command::Reserve { queue, wait } => {
            let reserved = if wait {
                client.reserve_wait(&queue).await
            } else {
                client.reserve(&queue).await
            };
            print_job(reserved).context("reserve")?;
        },
        Command::Peek { queue } => {
            print_job(client.peek(&queue).await).context("peek")?;
        },
        Command::Delete { queue, id } => {
            match client.delete(&queue, &id).await {
                Ok(()) => println!("deleted"),
                Err(ClientError::NotFound) => println!("not found"),
                Err(error) => return Err(error).context("delete"),
            }
        },
        Command::Stats { queue } => {
            print_yaml(&client.stats(&queue).await.context("stats")?)?;
        },
    }

    Ok(())
}

fn print_job(found: Result<Job, ClientError>) -> Result<()> {
    match found {
        Ok(job) => print_yaml(&job),
        Err(ClientError::NoJobs) => {
            println!("no jobs");
            Ok(())
        },
        Err(error) => Err(error.into()),
    }
}

fn print_yaml<T: Serialize>(value: &T) -> Result<()> {
    print!("{}", serde_yaml::to_string(value)?);
    Ok(())
}
