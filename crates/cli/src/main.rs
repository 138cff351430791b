#![allow(clippy::needless_return)]

use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use funeypot::{Config, Server};

/// Command line arguments for the Funeypot honeypot.
///
/// Everything else lives in the config file; the flags only locate it.
#[derive(Parser, Debug, Clone)]
#[command(name = "funeypot", version, about = "Multi-protocol brute-force honeypot")]
struct Args {
  /// Path to the config file.
  #[arg(short = 'c', long = "config", default_value = "config.yaml")]
  config: PathBuf,

  /// Don't generate a default config file when it does not exist.
  #[arg(long = "disable-generate", default_value_t = false)]
  disable_generate: bool,
}

fn init_tracing(level: &str) {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(format!("{level},russh=warn,hyper=warn,reqwest=warn")));

  tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
  let args = Args::parse();

  let config = match Config::load(&args.config, !args.disable_generate) {
    Ok(config) => config,
    Err(err) => {
      eprintln!("failed to load config {:?}: {err}", args.config);
      return std::process::ExitCode::FAILURE;
    }
  };

  init_tracing(&config.log.level);
  info!(version = env!("CARGO_PKG_VERSION"), "funeypot starting");

  let shutdown = CancellationToken::new();
  spawn_signal_handler(shutdown.clone());

  let server = match Server::init(config, shutdown.clone()).await {
    Ok(server) => server,
    Err(err) => {
      error!(error = %err, "failed to initialize");
      return std::process::ExitCode::FAILURE;
    }
  };

  if let Err(err) = server.serve().await {
    error!(error = %err, "server failed");
    return std::process::ExitCode::FAILURE;
  }

  info!("shutdown");
  return std::process::ExitCode::SUCCESS;
}


fn spawn_signal_handler(shutdown: CancellationToken) {
  tokio::spawn(async move {
    let ctrl_c = async {
      tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
      tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install sigterm handler")
        .recv()
        .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
      _ = ctrl_c => {},
      _ = terminate => {},
    }

    info!("received shutdown signal");
    shutdown.cancel();
  });
}
