use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// The fixed reporting endpoint, see https://docs.abuseipdb.com.
pub const REPORT_URL: &str = "https://api.abuseipdb.com/api/v2/report";

// AbuseIPDB category codes, see https://www.abuseipdb.com/categories.
const CATEGORIES_SSH: &[&str] = &["18", "22"];
const CATEGORIES_HTTP: &[&str] = &["18", "21"];
const CATEGORIES_FTP: &[&str] = &["18", "5"];

#[derive(Debug, Error)]
pub enum ReportError {
  #[error("Request error: {0}")]
  Http(#[from] reqwest::Error),
  #[error("Response status: {0}")]
  Status(reqwest::StatusCode),
  #[error("Rate limited, retry after {retry_after:?}")]
  RateLimited { retry_after: Option<Duration> },
  #[error("Response errors: {0}")]
  Api(String),
}

/// Client for the AbuseIPDB report API. A `429` from the server puts the
/// whole client into a cooldown window derived from `Retry-After`; the
/// expiry is a single atomically swapped timestamp, so checking it from the
/// gate takes no lock.
pub struct Client {
  key: String,
  interval: chrono::Duration,
  endpoint: String,
  http: reqwest::Client,
  cooldown_until_ms: AtomicI64,
}

impl Client {
  pub fn new(key: impl Into<String>, interval: Duration) -> Self {
    return Client {
      key: key.into(),
      interval: chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX),
      endpoint: REPORT_URL.to_string(),
      http: reqwest::Client::new(),
      cooldown_until_ms: AtomicI64::new(0),
    };
  }

  /// Point the client at a different endpoint, e.g. a local stand-in.
  pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.endpoint = endpoint.into();
    return self;
  }

  /// Minimum gap between two reports for the same ip.
  pub fn interval(&self) -> chrono::Duration {
    return self.interval;
  }

  /// The active cooldown expiry, if the client is currently cooling down.
  pub fn cooldown(&self) -> Option<DateTime<Utc>> {
    let ms = self.cooldown_until_ms.load(Ordering::Relaxed);
    let until = DateTime::<Utc>::from_timestamp_millis(ms)?;
    if Utc::now() < until {
      return Some(until);
    }
    return None;
  }

  pub async fn report_ssh(
    &self,
    ip: &str,
    timestamp: DateTime<Utc>,
    comment: &str,
  ) -> Result<i64, ReportError> {
    return self.report(ip, CATEGORIES_SSH, timestamp, comment).await;
  }

  pub async fn report_http(
    &self,
    ip: &str,
    timestamp: DateTime<Utc>,
    comment: &str,
  ) -> Result<i64, ReportError> {
    return self.report(ip, CATEGORIES_HTTP, timestamp, comment).await;
  }

  pub async fn report_ftp(
    &self,
    ip: &str,
    timestamp: DateTime<Utc>,
    comment: &str,
  ) -> Result<i64, ReportError> {
    return self.report(ip, CATEGORIES_FTP, timestamp, comment).await;
  }

  /// Submit one report and return the abuse confidence score.
  pub async fn report(
    &self,
    ip: &str,
    categories: &[&str],
    timestamp: DateTime<Utc>,
    comment: &str,
  ) -> Result<i64, ReportError> {
    let form = [
      ("ip", ip.to_string()),
      ("categories", categories.join(",")),
      (
        "timestamp",
        timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
      ),
      ("comment", comment.to_string()),
    ];

    let response = self
      .http
      .post(&self.endpoint)
      .header("Key", &self.key)
      .header("Accept", "application/json")
      .form(&form)
      .send()
      .await?;

    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
      let retry_after = response
        .headers()
        .get("Retry-After")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

      if let Some(retry_after) = retry_after {
        let until = Utc::now()
          + chrono::Duration::from_std(retry_after).unwrap_or(chrono::Duration::zero());
        self
          .cooldown_until_ms
          .store(until.timestamp_millis(), Ordering::Relaxed);
      }
      return Err(ReportError::RateLimited { retry_after });
    }

    if !status.is_success() {
      return Err(ReportError::Status(status));
    }

    let body: Response = response.json().await?;
    if !body.errors.is_empty() {
      let details = body
        .errors
        .iter()
        .map(|err| err.detail.as_str())
        .collect::<Vec<_>>()
        .join("; ");
      return Err(ReportError::Api(details));
    }

    return Ok(body.data.map(|data| data.abuse_confidence_score).unwrap_or(0));
  }
}

#[derive(Debug, Deserialize)]
struct Response {
  #[serde(default)]
  data: Option<ResponseData>,
  #[serde(default)]
  errors: Vec<ResponseError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseData {
  #[allow(unused)]
  #[serde(default)]
  ip_address: String,
  #[serde(default)]
  abuse_confidence_score: i64,
}

#[derive(Debug, Deserialize)]
struct ResponseError {
  #[serde(default)]
  detail: String,
  #[allow(unused)]
  #[serde(default)]
  status: i64,
}
