use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipeline::{Handler, Request};
use crate::store::AttemptKind;

const GREETING: &str = "220 FTP server ready.\r\n";

/// The FTP honeypot. Speaks just enough of the control protocol to collect
/// USER/PASS pairs; every PASS fails after the configured delay. A client
/// announcing itself with CLNT has that name recorded as its version.
pub(crate) struct FtpServer {
  address: String,
  delay: Duration,
  handler: Arc<Handler>,
  shutdown: CancellationToken,
}

impl FtpServer {
  pub(crate) fn new(
    address: String,
    delay: Duration,
    handler: Arc<Handler>,
    shutdown: CancellationToken,
  ) -> Self {
    return FtpServer {
      address,
      delay,
      handler,
      shutdown,
    };
  }

  pub(crate) async fn serve(self) -> std::io::Result<()> {
    let listener = TcpListener::bind(&self.address).await?;
    info!(address = %self.address, "ftp server listening");

    loop {
      let (stream, peer) = tokio::select! {
        _ = self.shutdown.cancelled() => break,
        accepted = listener.accept() => match accepted {
          Ok(accepted) => accepted,
          Err(err) => {
            warn!(error = %err, "failed to accept ftp connection");
            continue;
          }
        },
      };

      let connection = FtpConnection {
        peer,
        session_id: Uuid::new_v4().to_string(),
        delay: self.delay,
        handler: self.handler.clone(),
        shutdown: self.shutdown.clone(),
      };
      tokio::spawn(async move {
        if let Err(err) = connection.run(stream).await {
          debug!(peer = %peer, error = %err, "ftp connection ended");
        }
      });
    }

    info!("ftp server stopped");
    return Ok(());
  }
}

struct FtpConnection {
  peer: SocketAddr,
  session_id: String,
  delay: Duration,
  handler: Arc<Handler>,
  shutdown: CancellationToken,
}

impl FtpConnection {
  async fn run(&self, stream: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(GREETING.as_bytes()).await?;

    let mut user = String::new();
    let mut client_version = String::new();

    loop {
      let Some(line) = self.read_line(&mut reader).await? else {
        break;
      };

      let (verb, argument) = match line.split_once(' ') {
        Some((verb, argument)) => (verb.to_ascii_uppercase(), argument.trim().to_string()),
        None => (line.to_ascii_uppercase(), String::new()),
      };

      match verb.as_str() {
        "USER" => {
          user = argument;
          write_half
            .write_all(b"331 Please specify the password.\r\n")
            .await?;
        }
        "PASS" => {
          self.submit(&user, &argument, &client_version);
          tokio::select! {
            _ = self.shutdown.cancelled() => {},
            _ = tokio::time::sleep(self.delay) => {},
          }
          write_half.write_all(b"530 Login incorrect.\r\n").await?;
        }
        "CLNT" => {
          client_version = argument;
          write_half.write_all(b"200 OK.\r\n").await?;
        }
        "QUIT" => {
          write_half.write_all(b"221 Goodbye.\r\n").await?;
          break;
        }
        "SYST" => {
          write_half.write_all(b"215 UNIX Type: L8\r\n").await?;
        }
        _ => {
          write_half
            .write_all(b"530 Please login with USER and PASS.\r\n")
            .await?;
        }
      }
    }

    shutdown_write(&mut write_half).await;
    return Ok(());
  }

  async fn read_line(
    &self,
    reader: &mut BufReader<OwnedReadHalf>,
  ) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    let n = tokio::select! {
      _ = self.shutdown.cancelled() => return Ok(None),
      read = reader.read_line(&mut line) => read?,
    };
    if n == 0 {
      return Ok(None);
    }
    return Ok(Some(line.trim_end().to_string()));
  }

  fn submit(&self, user: &str, password: &str, client_version: &str) {
    self.handler.handle(Request {
      kind: AttemptKind::Ftp,
      time: Utc::now(),
      ip: self.peer.ip(),
      user: user.to_string(),
      password: password.to_string(),
      session_id: self.session_id.clone(),
      client_version: client_version.to_string(),
    });
  }
}

async fn shutdown_write(write_half: &mut OwnedWriteHalf) {
  let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geo::{CachedQuerier, GeoError, GeoInfo, GeoQuerier};
  use crate::report::Reporter;
  use crate::store::{SqliteStore, Store};
  use std::net::IpAddr;
  use tokio::io::AsyncReadExt;

  struct NoopQuerier;

  #[async_trait::async_trait]
  impl GeoQuerier for NoopQuerier {
    async fn query(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
      return Ok(GeoInfo {
        ip,
        location: String::new(),
        latitude: 0.0,
        longitude: 0.0,
      });
    }
  }

  async fn spawn_server() -> (Arc<dyn Store>, SocketAddr, CancellationToken) {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let geo = CachedQuerier::new(Arc::new(NoopQuerier), store.clone());
    let shutdown = CancellationToken::new();
    let handler = Handler::new(
      store.clone(),
      geo,
      Reporter::disabled(store.clone()),
      shutdown.clone(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let server = FtpServer::new(addr.to_string(), Duration::from_millis(10), handler, shutdown.clone());
    tokio::spawn(async move {
      server.serve().await.unwrap();
    });
    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;

    return (store, addr, shutdown);
  }

  async fn read_reply(stream: &mut TcpStream) -> String {
    let mut buf = [0u8; 256];
    let n = stream.read(&mut buf).await.unwrap();
    return String::from_utf8_lossy(&buf[..n]).to_string();
  }

  #[tokio::test]
  async fn test_login_always_fails_and_is_recorded() {
    let (store, addr, shutdown) = spawn_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert!(read_reply(&mut stream).await.starts_with("220"));

    stream.write_all(b"CLNT TestClient 1.0\r\n").await.unwrap();
    assert!(read_reply(&mut stream).await.starts_with("200"));

    stream.write_all(b"USER anonymous\r\n").await.unwrap();
    assert!(read_reply(&mut stream).await.starts_with("331"));

    stream.write_all(b"PASS secret\r\n").await.unwrap();
    assert!(read_reply(&mut stream).await.starts_with("530"));

    stream.write_all(b"QUIT\r\n").await.unwrap();
    assert!(read_reply(&mut stream).await.starts_with("221"));

    // The attempt lands in the store with the announced client version.
    let mut found = None;
    for _ in 0..100 {
      let mut seen = None;
      store
        .scan_brute_attempts(Utc::now() - chrono::Duration::hours(1), &mut |attempt, _| {
          seen = Some(attempt.clone());
          true
        })
        .await
        .unwrap();
      if seen.is_some() {
        found = seen;
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let attempt = found.expect("attempt should be recorded");
    assert_eq!(attempt.kind, AttemptKind::Ftp);
    assert_eq!(attempt.user, "anonymous");
    assert_eq!(attempt.password, "secret");
    assert_eq!(attempt.client_version, "TestClient 1.0");

    shutdown.cancel();
  }
}
