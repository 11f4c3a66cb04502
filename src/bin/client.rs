use std::process::ExitCode;

use powgate::config::{ClientConfig, Mode};
use powgate::logging::init_tracing;
use powgate::{DirectClient, RendezvousClient};
use tokio_util::sync::CancellationToken;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("powgate-client: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = init_tracing(config.debug) {
        eprintln!("powgate-client: {err}");
        return ExitCode::FAILURE;
    }

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    let quote = match config.mode {
        Mode::Direct => match DirectClient::from_config(&config) {
            Ok(client) => client.get_message(&token).await,
            Err(err) => {
                error!(%err, "invalid client config");
                return ExitCode::FAILURE;
            }
        },
        Mode::Rendezvous => match RendezvousClient::from_config(&config) {
            Ok(client) => client.get_message(&token).await,
            Err(err) => {
                error!(%err, "invalid client config");
                return ExitCode::FAILURE;
            }
        },
    };

    match quote {
        Ok(quote) => {
            println!("{}", String::from_utf8_lossy(&quote));
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, server = %config.server_addr(), "failed to get a quote");
            ExitCode::FAILURE
        }
    }
}
