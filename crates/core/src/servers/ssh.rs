use chrono::Utc;
use russh::server::{Auth, Handler as SshHandler};
use russh::{MethodKind, SshId};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config;
use crate::pipeline::{Handler, Request};
use crate::server::InitError;
use crate::sshkey;
use crate::store::AttemptKind;

/// How long to wait for the client's identification line before giving up on
/// capturing its version. Clients send it right after connecting, so in
/// practice one read suffices.
const VERSION_PEEK_TIMEOUT: Duration = Duration::from_millis(1000);

/// The SSH honeypot: accepts connections, records every password attempt and
/// rejects it after the configured delay. No credential ever succeeds.
pub(crate) struct SshServer {
  address: String,
  delay: Duration,
  config: Arc<russh::server::Config>,
  handler: Arc<Handler>,
  shutdown: CancellationToken,
}

impl SshServer {
  pub(crate) fn new(
    cfg: &config::Ssh,
    handler: Arc<Handler>,
    shutdown: CancellationToken,
  ) -> Result<Self, InitError> {
    let key = sshkey::host_key(&cfg.key_seed)?;

    let config = russh::server::Config {
      server_id: SshId::Standard(format!("SSH-2.0-{banner}", banner = cfg.banner)),
      keys: vec![key],
      methods: (&[MethodKind::Password]).as_slice().into(),
      // The artificial delay is ours; russh must not add its own.
      auth_rejection_time: Duration::ZERO,
      auth_rejection_time_initial: Some(Duration::ZERO),
      inactivity_timeout: Some(Duration::from_secs(60)),
      ..Default::default()
    };

    return Ok(SshServer {
      address: cfg.address.clone(),
      delay: cfg.delay,
      config: Arc::new(config),
      handler,
      shutdown,
    });
  }

  pub(crate) async fn serve(self) -> std::io::Result<()> {
    let listener = TcpListener::bind(&self.address).await?;
    info!(address = %self.address, "ssh server listening");

    loop {
      let (stream, peer) = tokio::select! {
        _ = self.shutdown.cancelled() => break,
        accepted = listener.accept() => match accepted {
          Ok(accepted) => accepted,
          Err(err) => {
            warn!(error = %err, "failed to accept ssh connection");
            continue;
          }
        },
      };

      let config = self.config.clone();
      let connection = SshConnection {
        ip: peer.ip(),
        session_id: Uuid::new_v4().to_string(),
        client_version: String::new(),
        delay: self.delay,
        handler: self.handler.clone(),
        shutdown: self.shutdown.clone(),
      };
      tokio::spawn(serve_connection(config, stream, connection));
    }

    info!("ssh server stopped");
    return Ok(());
  }
}

async fn serve_connection(
  config: Arc<russh::server::Config>,
  stream: TcpStream,
  mut connection: SshConnection,
) {
  // The client announces itself immediately after connecting, so its
  // identification line can be peeked off the socket before russh consumes
  // the stream.
  connection.client_version = peek_client_version(&stream).await.unwrap_or_default();

  let ip = connection.ip;
  match russh::server::run_stream(config, stream, connection).await {
    Ok(session) => {
      if let Err(err) = session.await {
        debug!(%ip, error = %err, "ssh session ended");
      }
    }
    Err(err) => {
      debug!(%ip, error = %err, "ssh handshake failed");
    }
  }
}

async fn peek_client_version(stream: &TcpStream) -> Option<String> {
  let mut buf = [0u8; 256];

  let peek = async {
    loop {
      let n = match stream.peek(&mut buf).await {
        Ok(0) => return None,
        Ok(n) => n,
        Err(_) => return None,
      };
      if let Some(end) = buf[..n].iter().position(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(&buf[..end]);
        let line = line.trim_end_matches('\r').trim();
        if line.starts_with("SSH-") {
          return Some(line.to_string());
        }
        return None;
      }
      if n == buf.len() {
        // No newline within a full buffer; not a sane identification line.
        return None;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  };

  return tokio::time::timeout(VERSION_PEEK_TIMEOUT, peek)
    .await
    .ok()
    .flatten();
}

struct SshConnection {
  ip: IpAddr,
  session_id: String,
  client_version: String,
  delay: Duration,
  handler: Arc<Handler>,
  shutdown: CancellationToken,
}

impl SshHandler for SshConnection {
  type Error = russh::Error;

  async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
    return Ok(Auth::Reject {
      proceed_with_methods: Some((&[MethodKind::Password]).as_slice().into()),
      partial_success: false,
    });
  }

  async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
    self.handler.handle(Request {
      kind: AttemptKind::Ssh,
      time: Utc::now(),
      ip: self.ip,
      user: user.to_string(),
      password: password.to_string(),
      session_id: self.session_id.clone(),
      client_version: self.client_version.clone(),
    });

    tokio::select! {
      _ = self.shutdown.cancelled() => {},
      _ = tokio::time::sleep(self.delay) => {},
    }

    return Ok(Auth::Reject {
      proceed_with_methods: None,
      partial_success: false,
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;

  async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    return (client, server);
  }

  #[tokio::test]
  async fn test_peek_client_version() {
    let (mut client, server) = socket_pair().await;
    client.write_all(b"SSH-2.0-Go\r\n").await.unwrap();

    let version = peek_client_version(&server).await;
    assert_eq!(version.as_deref(), Some("SSH-2.0-Go"));

    // Peeking leaves the line in the socket for the actual handshake.
    let version = peek_client_version(&server).await;
    assert_eq!(version.as_deref(), Some("SSH-2.0-Go"));
  }

  #[tokio::test]
  async fn test_peek_client_version_rejects_garbage() {
    let (mut client, server) = socket_pair().await;
    client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

    assert_eq!(peek_client_version(&server).await, None);
  }

  #[tokio::test]
  async fn test_peek_client_version_times_out_on_silence() {
    let (_client, server) = socket_pair().await;
    assert_eq!(peek_client_version(&server).await, None);
  }
}
