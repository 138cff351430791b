use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::geo::CachedQuerier;
use crate::report::Reporter;
use crate::store::{AttemptEvent, AttemptKind, Store};
use crate::util::{format_duration, short_session_id};

/// Ingress capacity; excess requests are shed, not queued.
const QUEUE_CAPACITY: usize = 1000;

/// Hard deadline for handling one request, including outbound HTTP calls.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// How long a `(ip, kind)` aggregate keeps accepting new requests after its
/// last activity.
pub(crate) const ACTIVITY_WINDOW: chrono::Duration = chrono::Duration::hours(24);

/// One credential attempt as captured by a protocol adapter.
#[derive(Debug, Clone)]
pub struct Request {
  pub kind: AttemptKind,
  pub time: DateTime<Utc>,
  pub ip: IpAddr,
  pub user: String,
  pub password: String,
  pub session_id: String,
  pub client_version: String,
}

/// Ingress for the attempt pipeline. Adapters call [`Handler::handle`], which
/// never blocks: when the queue is full the request is dropped with a
/// warning. A single consumer task drains the queue.
pub struct Handler {
  tx: mpsc::Sender<Request>,
  dropped: AtomicU64,
}

impl Handler {
  pub fn new(
    store: Arc<dyn Store>,
    geo: CachedQuerier,
    reporter: Reporter,
    shutdown: CancellationToken,
  ) -> Arc<Self> {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    tokio::spawn(consume(rx, store, geo, reporter, shutdown));
    return Arc::new(Handler {
      tx,
      dropped: AtomicU64::new(0),
    });
  }

  /// Enqueue one request. Returns immediately.
  pub fn handle(&self, request: Request) {
    if self.tx.try_send(request).is_err() {
      let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
      warn!(dropped, "queue full, dropping request");
    }
  }
}

async fn consume(
  mut rx: mpsc::Receiver<Request>,
  store: Arc<dyn Store>,
  geo: CachedQuerier,
  reporter: Reporter,
  shutdown: CancellationToken,
) {
  loop {
    let lag = rx.len();
    if lag > 0 {
      debug!(lag, "queue lag");
    }

    let request = tokio::select! {
      _ = shutdown.cancelled() => break,
      request = rx.recv() => match request {
        Some(request) => request,
        None => break,
      },
    };

    let result = tokio::time::timeout(
      REQUEST_TIMEOUT,
      handle_request(&store, &geo, &reporter, &shutdown, request),
    )
    .await;
    if result.is_err() {
      warn!("request handling timed out");
    }
  }

  rx.close();
  let mut residual = 0;
  while rx.try_recv().is_ok() {
    residual += 1;
  }
  if residual > 0 {
    info!(residual, "discarding queued requests on shutdown");
  }
  info!("attempt pipeline stopped");
}

async fn handle_request(
  store: &Arc<dyn Store>,
  geo: &CachedQuerier,
  reporter: &Reporter,
  shutdown: &CancellationToken,
  request: Request,
) {
  let ip = request.ip.to_string();

  // The attempt update always runs to completion; only the outbound HTTP
  // calls below abort on shutdown.
  let attempt = match store
    .incr_brute_attempt(AttemptEvent {
      ip: ip.clone(),
      kind: request.kind,
      time: request.time,
      user: request.user.clone(),
      password: request.password.clone(),
      client_version: request.client_version.clone(),
      not_before: request.time - ACTIVITY_WINDOW,
    })
    .await
  {
    Ok(attempt) => attempt,
    Err(err) => {
      error!(%ip, error = %err, "failed to record attempt");
      return;
    }
  };

  // Enrichment is best-effort; the attempt is already durable.
  let location = tokio::select! {
    _ = shutdown.cancelled() => None,
    result = geo.query(request.ip) => match result {
      Ok(info) => Some(info.location),
      Err(err) => {
        error!(%ip, error = %err, "failed to query geo");
        None
      }
    },
  };

  info!(
    kind = request.kind.as_str(),
    %ip,
    session_id = short_session_id(&request.session_id),
    count = attempt.count,
    duration = %format_duration(attempt.duration()),
    user = %request.user,
    password = %request.password,
    client_version = %request.client_version,
    location = location.as_deref().unwrap_or(""),
    "login"
  );

  tokio::select! {
    _ = shutdown.cancelled() => {},
    _ = reporter.maybe_report(&attempt) => {},
  }
}
