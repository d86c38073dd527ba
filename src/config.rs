use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Download one piece of a torrent from the peers listed in a metadata file
#[derive(Parser, Debug)]
#[command(name = "peerwire", version)]
pub struct Cli {
    /// Bencoded metadata file (info_hash, peers, piece layout)
    pub metadata: PathBuf,

    /// Where downloaded pieces are written
    #[arg(short, long, default_value = "download.bin")]
    pub output: PathBuf,

    /// Seconds to wait for a peer to send anything
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// tracing filter directive, e.g. `info` or `peerwire=trace`
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Runtime settings shared by every session
#[derive(Debug, Clone)]
pub struct Config {
    pub output:          PathBuf,
    /// Bound on each wait for peer data; elapsing is the Timeout signal
    pub read_timeout:    Duration,
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output:          PathBuf::from("download.bin"),
            read_timeout:    Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Cli> for Config {
    fn from(cli: &Cli) -> Self {
        Self {
            output:          cli.output.clone(),
            read_timeout:    Duration::from_secs(cli.timeout_secs),
            connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
        }
    }
}
