use std::process::ExitCode;
use std::sync::Arc;

use powgate::config::{Mode, ServerConfig};
use powgate::logging::init_tracing;
use powgate::server::{DirectServer, Gatekeeper, RendezvousServer};
use powgate::{Error, Quotes, SessionPool};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("powgate-server: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = init_tracing(config.debug) {
        eprintln!("powgate-server: {err}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServerConfig) -> Result<(), Error> {
    let quotes = Quotes::load(&config.quotes_file)?;
    let gate = Gatekeeper::from_config(&config, Arc::new(quotes));

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        shutdown.cancel();
    });

    info!(mode = ?config.mode, difficulty = config.difficulty, algorithm = ?config.algorithm, "starting");
    match config.mode {
        Mode::Direct => {
            DirectServer::bind(config.addr(), gate)
                .await?
                .listen(token)
                .await
        }
        Mode::Rendezvous => {
            let pool = Arc::new(SessionPool::new(config.session_addrs.iter().copied()));
            RendezvousServer::bind(config.addr(), gate, pool)
                .await?
                .listen(token)
                .await
        }
    }
}
