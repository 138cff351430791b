use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::abuseipdb;
use crate::store::{AttemptKind, BruteAttempt, Store};
use crate::util::format_duration;

/// Attempts below this count are never reported.
const REPORT_THRESHOLD: i64 = 5;

/// Decides whether an updated attempt gets reported to AbuseIPDB, builds the
/// report comment and persists the report history.
pub struct Reporter {
  client: Option<Arc<abuseipdb::Client>>,
  store: Arc<dyn Store>,
}

impl Reporter {
  pub fn new(client: Option<Arc<abuseipdb::Client>>, store: Arc<dyn Store>) -> Self {
    return Reporter { client, store };
  }

  pub fn disabled(store: Arc<dyn Store>) -> Self {
    return Reporter {
      client: None,
      store,
    };
  }

  /// Report `attempt` if every gate passes. Failures are logged, never
  /// retried; the next qualifying attempt tries again.
  pub async fn maybe_report(&self, attempt: &BruteAttempt) {
    let Some(client) = &self.client else {
      return;
    };
    if attempt.count < REPORT_THRESHOLD {
      return;
    }
    if let Some(until) = client.cooldown() {
      debug!(ip = %attempt.ip, %until, "skipping report, reporter cooling down");
      return;
    }

    let last = match self.store.last_abuseipdb_report(&attempt.ip).await {
      Ok(last) => last,
      Err(err) => {
        error!(ip = %attempt.ip, error = %err, "failed to load last report");
        return;
      }
    };
    if let Some(last) = &last {
      if Utc::now() - last.reported_at < client.interval() {
        return;
      }
    }

    let comment = report_comment(attempt);
    let result = match attempt.kind {
      AttemptKind::Ssh => {
        client
          .report_ssh(&attempt.ip, attempt.stopped_at, &comment)
          .await
      }
      AttemptKind::Http => {
        client
          .report_http(&attempt.ip, attempt.stopped_at, &comment)
          .await
      }
      AttemptKind::Ftp => {
        client
          .report_ftp(&attempt.ip, attempt.stopped_at, &comment)
          .await
      }
    };

    let score = match result {
      Ok(score) => score,
      Err(err) => {
        error!(ip = %attempt.ip, error = %err, "failed to report attempt");
        return;
      }
    };

    info!(ip = %attempt.ip, score, "reported");
    if let Some(last) = &last {
      if last.score != score {
        info!(ip = %attempt.ip, previous = last.score, score, "score changed");
      }
    }

    if let Err(err) = self
      .store
      .create_abuseipdb_report(&attempt.ip, Utc::now(), score)
      .await
    {
      error!(ip = %attempt.ip, error = %err, "failed to record report");
    }
  }
}

fn report_comment(attempt: &BruteAttempt) -> String {
  return format!(
    "Funeypot detected {count} {kind} attempts in {duration}. Last by user {user:?}, password {password:?}, client {client:?}.",
    count = attempt.count,
    kind = attempt.kind,
    duration = format_duration(attempt.duration()),
    user = attempt.user,
    password = attempt.masked_password(),
    client = attempt.short_client_version(),
  );
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{AttemptEvent, SqliteStore};
  use axum::routing::post;
  use axum::Router;
  use chrono::{DateTime, Duration, Utc};
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn attempt(count: i64) -> BruteAttempt {
    let stopped = Utc::now();
    return BruteAttempt {
      id: 1,
      ip: "127.0.0.1".to_string(),
      kind: AttemptKind::Ssh,
      user: "username4".to_string(),
      password: "password4".to_string(),
      client_version: "SSH-2.0-Go".to_string(),
      started_at: stopped - Duration::seconds(8),
      stopped_at: stopped,
      count,
      created_at: stopped,
      updated_at: stopped,
    };
  }

  #[test]
  fn test_report_comment() {
    assert_eq!(
      report_comment(&attempt(5)),
      "Funeypot detected 5 ssh attempts in 8s. Last by user \"username4\", password \"pas***rd4\", client \"Go\"."
    );

    let mut http = attempt(6);
    http.kind = AttemptKind::Http;
    http.user = "username".to_string();
    http.password = "password".to_string();
    http.client_version = "curl/8.0".to_string();
    assert_eq!(
      report_comment(&http),
      "Funeypot detected 6 http attempts in 8s. Last by user \"username\", password \"pa****rd\", client \"curl/8.0\"."
    );
  }

  struct Mock {
    calls: Arc<AtomicUsize>,
    endpoint: String,
  }

  async fn spawn_reporter_mock(status: u16) -> Mock {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    let app = Router::new().route(
      "/api/v2/report",
      post(move || {
        let calls = handler_calls.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          use axum::response::IntoResponse;
          match status {
            200 => axum::Json(serde_json::json!({
              "data": {"ipAddress": "127.0.0.1", "abuseConfidenceScore": 33}
            }))
            .into_response(),
            _ => (
              axum::http::StatusCode::from_u16(status).unwrap(),
              [("Retry-After", "60")],
              "",
            )
              .into_response(),
          }
        }
      }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });

    return Mock {
      calls,
      endpoint: format!("http://{addr}/api/v2/report"),
    };
  }

  async fn store_with_report(
    reported_at: Option<DateTime<Utc>>,
  ) -> Arc<dyn Store> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    if let Some(reported_at) = reported_at {
      store
        .create_abuseipdb_report("127.0.0.1", reported_at, 10)
        .await
        .unwrap();
    }
    return store;
  }

  fn reporter(endpoint: &str, store: Arc<dyn Store>) -> Reporter {
    let client = abuseipdb::Client::new("test_key", std::time::Duration::from_secs(20 * 60))
      .with_endpoint(endpoint);
    return Reporter::new(Some(Arc::new(client)), store);
  }

  #[tokio::test]
  async fn test_below_threshold_not_reported() {
    let mock = spawn_reporter_mock(200).await;
    let store = store_with_report(None).await;
    let gate = reporter(&mock.endpoint, store.clone());

    gate.maybe_report(&attempt(4)).await;
    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
    assert!(store
      .last_abuseipdb_report("127.0.0.1")
      .await
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_reported_and_recorded() {
    let mock = spawn_reporter_mock(200).await;
    let store = store_with_report(None).await;
    let gate = reporter(&mock.endpoint, store.clone());

    gate.maybe_report(&attempt(5)).await;
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);

    let report = store
      .last_abuseipdb_report("127.0.0.1")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(report.score, 33);
  }

  #[tokio::test]
  async fn test_recent_report_suppresses() {
    let mock = spawn_reporter_mock(200).await;
    let store = store_with_report(Some(Utc::now() - Duration::minutes(5))).await;
    let gate = reporter(&mock.endpoint, store.clone());

    gate.maybe_report(&attempt(5)).await;
    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_old_report_does_not_suppress() {
    let mock = spawn_reporter_mock(200).await;
    let store = store_with_report(Some(Utc::now() - Duration::minutes(30))).await;
    let gate = reporter(&mock.endpoint, store.clone());

    gate.maybe_report(&attempt(5)).await;
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cooldown_suppresses_and_429_does_not_record() {
    let mock = spawn_reporter_mock(429).await;
    let store = store_with_report(None).await;
    let gate = reporter(&mock.endpoint, store.clone());

    gate.maybe_report(&attempt(5)).await;
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    assert!(store
      .last_abuseipdb_report("127.0.0.1")
      .await
      .unwrap()
      .is_none());

    // Within the cooldown window no further request goes out.
    gate.maybe_report(&attempt(6)).await;
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_disabled_reporter_is_inert() {
    let store = store_with_report(None).await;
    let gate = Reporter::disabled(store.clone());
    gate.maybe_report(&attempt(50)).await;
    assert!(store
      .last_abuseipdb_report("127.0.0.1")
      .await
      .unwrap()
      .is_none());
  }

  // Readers that see a report can rely on an attempt with count >= 5 having
  // been committed first; the gate only ever runs on the already-updated row.
  #[tokio::test]
  async fn test_report_follows_attempt_commit() {
    let mock = spawn_reporter_mock(200).await;
    let store = store_with_report(None).await;
    let gate = reporter(&mock.endpoint, store.clone());

    let mut updated = None;
    for n in 0..5 {
      let now = Utc::now();
      updated = Some(
        store
          .incr_brute_attempt(AttemptEvent {
            ip: "127.0.0.1".to_string(),
            kind: AttemptKind::Ssh,
            time: now,
            user: format!("user{n}"),
            password: format!("pass{n}"),
            client_version: String::new(),
            not_before: now - Duration::hours(24),
          })
          .await
          .unwrap(),
      );
    }
    gate.maybe_report(&updated.unwrap()).await;

    let report = store
      .last_abuseipdb_report("127.0.0.1")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(report.score, 33);
  }
}
