use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address to receive datagrams on.
    #[arg(short, long, env = "ADDR", default_value = "0.0.0.0:2097")]
    pub(crate) addr: SocketAddr,
    /// Path of the SQLite database holding jobs. Created if missing.
    #[arg(long, env = "DB_PATH", default_value = "jobs.db")]
    pub(crate) db_path: PathBuf,
    /// Most verbose level of log messages to emit.
    #[arg(short, long, default_value_t = Level::INFO)]
    pub(crate) log_level: Level,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}
