use axum::http::{header, Method, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use constant_time_eq::constant_time_eq;
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

use crate::geo::CachedQuerier;
use crate::selfip;
use crate::store::Store;

const INDEX_HTML: &str = include_str!("dashboard.html");

/// The authenticated dashboard behind the HTTP honeypot: an attack map feed
/// plus a self-locate endpoint. Requests only reach it with the configured
/// credentials; everything else is honeypot traffic.
pub(crate) struct Dashboard {
  username: String,
  password: String,
  store: Arc<dyn Store>,
  geo: CachedQuerier,
  http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ApiPoint {
  ip: String,
  count: i64,
  latitude: f64,
  longitude: f64,
}

#[derive(Debug, Serialize)]
struct ApiPoints {
  points: Vec<ApiPoint>,
  next: i64,
}

#[derive(Debug, Serialize)]
struct ApiSelf {
  ip: String,
  location: String,
  latitude: f64,
  longitude: f64,
}

impl Dashboard {
  pub(crate) fn new(
    username: String,
    password: String,
    store: Arc<dyn Store>,
    geo: CachedQuerier,
  ) -> Self {
    return Dashboard {
      username,
      password,
      store,
      geo,
      http: reqwest::Client::new(),
    };
  }

  /// Compare credentials without leaking their length or contents through
  /// timing. Both comparisons always run.
  pub(crate) fn authorize(&self, username: &str, password: &str) -> bool {
    let user_ok = constant_time_eq(username.as_bytes(), self.username.as_bytes());
    let password_ok = constant_time_eq(password.as_bytes(), self.password.as_bytes());
    return user_ok & password_ok;
  }

  pub(crate) async fn handle(&self, method: &Method, path: &str, query: Option<&str>) -> Response {
    if *method != Method::GET {
      return StatusCode::NOT_FOUND.into_response();
    }

    return match path {
      "/" | "/index.html" => Html(INDEX_HTML).into_response(),
      "/api/points" => self.points(after_from_query(query)).await,
      "/api/self" => self.self_info().await,
      _ => StatusCode::NOT_FOUND.into_response(),
    };
  }

  async fn points(&self, after: DateTime<Utc>) -> Response {
    let mut seen = std::collections::HashSet::new();
    let mut points = vec![];
    let mut next = after;

    let result = self
      .store
      .scan_brute_attempts(after, &mut |attempt, geo| {
        if attempt.updated_at > next {
          next = attempt.updated_at;
        }
        if !seen.insert(attempt.ip.clone()) {
          return true;
        }
        let Some(geo) = geo else {
          return true;
        };
        points.push(ApiPoint {
          ip: attempt.ip.clone(),
          count: attempt.count,
          latitude: geo.latitude,
          longitude: geo.longitude,
        });
        return true;
      })
      .await;

    if let Err(err) = result {
      error!(error = %err, "failed to scan attempts");
      return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    return with_cors(Json(ApiPoints {
      points,
      next: next.timestamp(),
    }));
  }

  async fn self_info(&self) -> Response {
    let ip = match selfip::get(&self.http).await {
      Ok(ip) => ip,
      Err(err) => {
        error!(error = %err, "failed to probe own ip");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
      }
    };

    let info = match self.geo.query(ip).await {
      Ok(info) => info,
      Err(err) => {
        error!(%ip, error = %err, "failed to locate own ip");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
      }
    };

    return with_cors(Json(ApiSelf {
      ip: ip.to_string(),
      location: info.location,
      latitude: info.latitude,
      longitude: info.longitude,
    }));
  }
}

fn with_cors(body: impl IntoResponse) -> Response {
  return ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], body).into_response();
}

fn after_from_query(query: Option<&str>) -> DateTime<Utc> {
  let seconds = query
    .and_then(|query| {
      query
        .split('&')
        .find_map(|pair| pair.strip_prefix("after="))
    })
    .and_then(|value| value.parse::<i64>().ok())
    .unwrap_or(0);
  return DateTime::<Utc>::from_timestamp(seconds, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geo::{GeoError, GeoInfo, GeoQuerier};
  use crate::store::{AttemptEvent, AttemptKind, IpGeo, SqliteStore};
  use axum::body::to_bytes;
  use std::net::IpAddr;

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

  async fn dashboard() -> (Arc<dyn Store>, Dashboard) {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let geo = CachedQuerier::new(Arc::new(NoopQuerier), store.clone());
    let dashboard = Dashboard::new(
      "admin".to_string(),
      "dashboardpw".to_string(),
      store.clone(),
      geo,
    );
    return (store, dashboard);
  }

  #[tokio::test]
  async fn test_authorize() {
    let (_store, dashboard) = dashboard().await;
    assert!(dashboard.authorize("admin", "dashboardpw"));
    assert!(!dashboard.authorize("admin", "wrong"));
    assert!(!dashboard.authorize("wrong", "dashboardpw"));
    assert!(!dashboard.authorize("", ""));
  }

  #[tokio::test]
  async fn test_routes() {
    let (_store, dashboard) = dashboard().await;

    let response = dashboard.handle(&Method::GET, "/", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = dashboard.handle(&Method::GET, "/nope", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = dashboard.handle(&Method::POST, "/api/points", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn test_points_dedups_and_requires_geo() {
    let (store, dashboard) = dashboard().await;

    let now = Utc::now();
    for (ip, n) in [("198.51.100.1", 3), ("198.51.100.2", 1)] {
      for i in 0..n {
        store
          .incr_brute_attempt(AttemptEvent {
            ip: ip.to_string(),
            kind: AttemptKind::Ssh,
            time: now + chrono::Duration::seconds(i),
            user: "u".to_string(),
            password: "p".to_string(),
            client_version: String::new(),
            not_before: now - chrono::Duration::hours(24),
          })
          .await
          .unwrap();
      }
    }
    store
      .save_ip_geo(&IpGeo {
        ip: "198.51.100.1".to_string(),
        location: "Testland".to_string(),
        latitude: 12.0,
        longitude: 34.0,
        created_at: now,
        updated_at: now,
      })
      .await
      .unwrap();

    let response = dashboard
      .handle(&Method::GET, "/api/points", Some("after=0"))
      .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
      response
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .unwrap(),
      "*"
    );

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();

    // Only the ip with a geo row shows up, once.
    let points = parsed["points"].as_array().unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0]["ip"], "198.51.100.1");
    assert_eq!(points[0]["count"], 3);
    assert!(parsed["next"].as_i64().unwrap() >= now.timestamp());
  }

  #[test]
  fn test_after_from_query() {
    assert_eq!(after_from_query(None).timestamp(), 0);
    assert_eq!(after_from_query(Some("after=1700000000")).timestamp(), 1700000000);
    assert_eq!(after_from_query(Some("x=1&after=12")).timestamp(), 12);
    assert_eq!(after_from_query(Some("after=junk")).timestamp(), 0);
  }
}
