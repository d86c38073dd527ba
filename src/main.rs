use clap::Parser;
use peerwire::{
    ApplicationError, Metadata, SessionContext,
    config::{Cli, Config},
    session,
};
use std::path::Path;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ApplicationError> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli)?;

    // Load metadata and size the output file
    let metadata = Metadata::from_file(&cli.metadata)?;
    metadata.log_info();

    if metadata.peers.is_empty() {
        return Err(ApplicationError::PeerError("no peers".into()));
    }

    let ctx = SessionContext::new(&metadata, Config::from(&cli)).await?;

    // One peer at a time; the first one that delivers a piece ends the run
    for peer in &metadata.peers {
        match session::run(&ctx, peer).await {
            Ok(index) => {
                info!(
                    %peer,
                    index,
                    completed = ctx.completed(),
                    pieces = ctx.num_of_pieces(),
                    "download finished"
                );
                return Ok(());
            }
            Err(e) => warn!(%peer, error = %e, "session failed"),
        }
    }

    Err(ApplicationError::PeerError(
        "no peer delivered a piece".into(),
    ))
}

fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>, ApplicationError> {
    let filter = EnvFilter::try_new(&cli.log_level)
        .map_err(|e| ApplicationError::ConfigError(format!("log level: {}", e)))?;

    match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path.file_name().ok_or_else(|| {
                ApplicationError::ConfigError(format!("log file {}", path.display()))
            })?;

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}
