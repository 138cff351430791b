use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::abuseipdb;
use crate::config::Config;
use crate::dashboard::Dashboard;
use crate::geo::{CachedQuerier, IpapiQuerier};
use crate::pipeline::Handler;
use crate::report::Reporter;
use crate::servers::{FtpServer, HttpServer, SshServer};
use crate::store::{self, StorageError};

#[derive(Debug, Error)]
pub enum InitError {
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),
  #[error("Host key error: {0}")]
  HostKey(#[from] russh::keys::ssh_key::Error),
  #[error("IO error: {0}")]
  IO(#[from] std::io::Error),
  #[error("Task error: {0}")]
  Join(#[from] tokio::task::JoinError),
}

/// The assembled honeypot: store, pipeline, reporter and the protocol
/// listeners wired together from the config. Cancelling the shutdown token
/// stops the listeners and drains the pipeline.
pub struct Server {
  ssh: SshServer,
  http: Option<HttpServer>,
  ftp: Option<FtpServer>,
  shutdown: CancellationToken,
}

impl Server {
  pub async fn init(config: Config, shutdown: CancellationToken) -> Result<Self, InitError> {
    let store = store::connect(&config.database).await?;
    let geo = CachedQuerier::new(Arc::new(IpapiQuerier::new()), store.clone());

    let client = config.abuseipdb.enabled.then(|| {
      Arc::new(abuseipdb::Client::new(
        config.abuseipdb.key.clone(),
        config.abuseipdb.interval,
      ))
    });
    let reporter = Reporter::new(client, store.clone());

    let handler = Handler::new(store.clone(), geo.clone(), reporter, shutdown.clone());

    let ssh = SshServer::new(&config.ssh, handler.clone(), shutdown.clone())?;

    let http = config.http.enabled.then(|| {
      let dashboard = config.dashboard.enabled.then(|| {
        Arc::new(Dashboard::new(
          config.dashboard.username.clone(),
          config.dashboard.password.clone(),
          store.clone(),
          geo.clone(),
        ))
      });
      HttpServer::new(
        config.http.address.clone(),
        config.ssh.delay,
        handler.clone(),
        dashboard,
        shutdown.clone(),
      )
    });

    let ftp = config.ftp.enabled.then(|| {
      FtpServer::new(
        config.ftp.address.clone(),
        config.ssh.delay,
        handler.clone(),
        shutdown.clone(),
      )
    });

    return Ok(Server {
      ssh,
      http,
      ftp,
      shutdown,
    });
  }

  /// Run all listeners until the shutdown token cancels or one of them
  /// fails. A listener failure cancels the remaining tasks.
  pub async fn serve(self) -> Result<(), InitError> {
    let mut set: JoinSet<std::io::Result<()>> = JoinSet::new();

    set.spawn(self.ssh.serve());
    if let Some(http) = self.http {
      set.spawn(http.serve());
    }
    if let Some(ftp) = self.ftp {
      set.spawn(ftp.serve());
    }

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
      match joined {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
          error!(error = %err, "server task failed");
          self.shutdown.cancel();
          first_error.get_or_insert(InitError::IO(err));
        }
        Err(err) => {
          error!(error = %err, "server task panicked");
          self.shutdown.cancel();
          first_error.get_or_insert(InitError::Join(err));
        }
      }
    }

    return match first_error {
      Some(err) => Err(err),
      None => Ok(()),
    };
  }
}
