mod args;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use datagram_jobs::{Broker, JobStore};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::args::Args;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(args.log_level)
            .init();
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(args.log_level)
            .init();
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            info!("shutting down");
            cancel.cancel();
        });
    }

    if let Err(error) = begin(args, cancel).await {
        error!(error = %format!("{error:#}"), "encountered runtime error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn begin(args: Args, cancel: CancellationToken) -> Result<()> {
    let store = JobStore::open_path(&args.db_path).await.with_context(|| {
        format!("opening job database {}", args.db_path.display())
    })?;
    info!(db_path = %args.db_path.display(), "opened job database");

    let result = serve(&args, store.clone(), cancel).await;

    // Close the store even if serving failed, so the WAL is checkpointed.
    store.close().await;

    result
}

async fn serve(
    args: &Args,
    store: JobStore,
    cancel: CancellationToken,
) -> Result<()> {
    let broker = Broker::bind(args.addr, store)
        .await
        .with_context(|| format!("binding {}", args.addr))?;

    broker.run(cancel).await.context("receiving datagrams")
}
