use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::prelude::*;
use chrono::Utc;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dashboard::Dashboard;
use crate::geo::is_reserved;
use crate::pipeline::{Handler, Request};
use crate::store::AttemptKind;

/// The HTTP basic-auth honeypot. Every request gets a 401 challenge after
/// the configured delay; requests carrying the dashboard's credentials are
/// dispatched to the dashboard instead of the pipeline.
pub(crate) struct HttpServer {
  address: String,
  state: HttpState,
}

#[derive(Clone)]
struct HttpState {
  handler: Arc<Handler>,
  dashboard: Option<Arc<Dashboard>>,
  delay: Duration,
  shutdown: CancellationToken,
}

impl HttpServer {
  pub(crate) fn new(
    address: String,
    delay: Duration,
    handler: Arc<Handler>,
    dashboard: Option<Arc<Dashboard>>,
    shutdown: CancellationToken,
  ) -> Self {
    return HttpServer {
      address,
      state: HttpState {
        handler,
        dashboard,
        delay,
        shutdown,
      },
    };
  }

  pub(crate) async fn serve(self) -> std::io::Result<()> {
    let shutdown = self.state.shutdown.clone();
    let app = router(self.state);

    let listener = TcpListener::bind(&self.address).await?;
    info!(address = %self.address, "http server listening");

    axum::serve(
      listener,
      app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;

    info!("http server stopped");
    return Ok(());
  }
}

fn router(state: HttpState) -> Router {
  return Router::new()
    .fallback(handle)
    .layer(TraceLayer::new_for_http())
    .with_state(state);
}

async fn handle(
  State(state): State<HttpState>,
  ConnectInfo(peer): ConnectInfo<SocketAddr>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
) -> Response {
  let credentials = basic_credentials(&headers);

  if let (Some(dashboard), Some((user, password))) = (&state.dashboard, &credentials) {
    if dashboard.authorize(user, password) {
      return dashboard.handle(&method, uri.path(), uri.query()).await;
    }
  }

  if let Some((user, password)) = credentials {
    let ip = client_ip(peer, &headers);
    state.handler.handle(Request {
      kind: AttemptKind::Http,
      time: Utc::now(),
      ip,
      user,
      password,
      session_id: Uuid::new_v4().to_string(),
      client_version: headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string(),
    });
  }

  tokio::select! {
    _ = state.shutdown.cancelled() => {},
    _ = tokio::time::sleep(state.delay) => {},
  }

  return (
    StatusCode::UNAUTHORIZED,
    [(header::WWW_AUTHENTICATE, "Basic realm=\"Restricted\"")],
    "Unauthorized\n",
  )
    .into_response();
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
  let authorization = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
  let encoded = authorization.strip_prefix("Basic ")?;
  let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
  let decoded = String::from_utf8(decoded).ok()?;
  let (user, password) = decoded.split_once(':')?;
  return Some((user.to_string(), password.to_string()));
}

/// The source address of a request. When the direct peer is not globally
/// routable the request went through a reverse proxy, so the last entry of
/// `X-Forwarded-For` is the address that proxy saw. A single trusted proxy
/// is assumed; chains are not modeled.
fn client_ip(peer: SocketAddr, headers: &HeaderMap) -> IpAddr {
  let direct = peer.ip();
  if !is_reserved(direct) {
    return direct;
  }

  let Some(forwarded) = headers
    .get("x-forwarded-for")
    .and_then(|value| value.to_str().ok())
  else {
    return direct;
  };
  let Some(last) = forwarded.split(',').next_back() else {
    return direct;
  };
  match last.trim().parse::<IpAddr>() {
    Ok(ip) => return ip,
    Err(err) => {
      warn!(forwarded, error = %err, "invalid x-forwarded-for entry");
      return direct;
    }
  }
}
