mod postgres;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::config;
use crate::util::truncate_str;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Widest value persisted for user, password, client version and location.
pub(crate) const MAX_FIELD_BYTES: usize = 255;

#[derive(Debug, Error)]
pub enum StorageError {
  #[error("Sqlite error: {0}")]
  Sqlite(#[from] funeypot_sqlite::Error),
  #[error("Postgres error: {0}")]
  Postgres(#[from] tokio_postgres::Error),
  #[error("Postgres pool error: {0}")]
  Pool(#[from] deadpool_postgres::PoolError),
  #[error("Postgres pool setup error: {0}")]
  PoolSetup(#[from] deadpool_postgres::BuildError),
  #[error("Invalid dsn: {0}")]
  InvalidDsn(String),
  #[error("Corrupt row: {0}")]
  CorruptRow(String),
}

/// The protocol a brute-force attempt arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptKind {
  Ssh = 1,
  Http = 2,
  Ftp = 3,
}

impl AttemptKind {
  pub fn as_str(&self) -> &'static str {
    return match self {
      AttemptKind::Ssh => "ssh",
      AttemptKind::Http => "http",
      AttemptKind::Ftp => "ftp",
    };
  }

  pub(crate) fn from_i64(value: i64) -> Option<AttemptKind> {
    return match value {
      1 => Some(AttemptKind::Ssh),
      2 => Some(AttemptKind::Http),
      3 => Some(AttemptKind::Ftp),
      _ => None,
    };
  }
}

impl std::fmt::Display for AttemptKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    return f.write_str(self.as_str());
  }
}

/// Aggregated record of repeated attempts from one ip on one protocol within
/// a 24 hour activity window. The newest row per `(ip, kind)` is the current
/// one; older rows are kept but never joined again.
#[derive(Debug, Clone)]
pub struct BruteAttempt {
  pub id: i64,
  pub ip: String,
  pub kind: AttemptKind,
  pub user: String,
  pub password: String,
  pub client_version: String,
  pub started_at: DateTime<Utc>,
  pub stopped_at: DateTime<Utc>,
  pub count: i64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl BruteAttempt {
  pub fn duration(&self) -> chrono::Duration {
    return self.stopped_at - self.started_at;
  }

  /// The password with only up to four head and tail characters revealed.
  pub fn masked_password(&self) -> String {
    let chars: Vec<char> = self.password.chars().collect();
    let reveal = (chars.len() / 3).min(4);

    let mut masked = String::with_capacity(self.password.len());
    masked.extend(&chars[..reveal]);
    masked.extend(std::iter::repeat('*').take(chars.len() - 2 * reveal));
    masked.extend(&chars[chars.len() - reveal..]);
    return masked;
  }

  pub fn short_client_version(&self) -> &str {
    return self
      .client_version
      .strip_prefix("SSH-2.0-")
      .unwrap_or(&self.client_version);
  }
}

/// Cached geo lookup result for one ip.
#[derive(Debug, Clone)]
pub struct IpGeo {
  pub ip: String,
  pub location: String,
  pub latitude: f64,
  pub longitude: f64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// One submitted AbuseIPDB report. Append-only; the newest row per ip gates
/// the next report.
#[derive(Debug, Clone)]
pub struct AbuseipdbReport {
  pub id: i64,
  pub ip: String,
  pub reported_at: DateTime<Utc>,
  pub score: i64,
  pub created_at: DateTime<Utc>,
}

/// A single credential attempt to merge into the attempts table.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
  pub ip: String,
  pub kind: AttemptKind,
  pub time: DateTime<Utc>,
  pub user: String,
  pub password: String,
  pub client_version: String,
  /// A current attempt whose `stopped_at` is at or before this instant starts
  /// a fresh row instead of being joined.
  pub not_before: DateTime<Utc>,
}

impl AttemptEvent {
  /// Clamp free-form fields to their column widths.
  pub(crate) fn truncated(mut self) -> Self {
    self.user = truncate_str(&self.user, MAX_FIELD_BYTES);
    self.password = truncate_str(&self.password, MAX_FIELD_BYTES);
    self.client_version = truncate_str(&self.client_version, MAX_FIELD_BYTES);
    return self;
  }
}

pub type ScanVisitor<'a> = &'a mut (dyn FnMut(&BruteAttempt, Option<&IpGeo>) -> bool + Send);

/// Durable state shared by the pipeline, the reporter gate and the dashboard.
#[async_trait]
pub trait Store: Send + Sync {
  /// Merge one attempt into the current `(ip, kind)` row, or start a fresh
  /// row when the current one stopped at or before `not_before`. The merge is
  /// atomic: concurrent events for the same pair never lose a count.
  async fn incr_brute_attempt(&self, event: AttemptEvent) -> Result<BruteAttempt, StorageError>;

  /// The most recent report row for `ip`, if any.
  async fn last_abuseipdb_report(&self, ip: &str)
    -> Result<Option<AbuseipdbReport>, StorageError>;

  async fn take_ip_geo(&self, ip: &str) -> Result<Option<IpGeo>, StorageError>;

  /// Upsert by primary key `ip`.
  async fn save_ip_geo(&self, geo: &IpGeo) -> Result<(), StorageError>;

  async fn create_abuseipdb_report(
    &self,
    ip: &str,
    reported_at: DateTime<Utc>,
    score: i64,
  ) -> Result<(), StorageError>;

  /// Visit attempts updated after `updated_after` in `updated_at` order, each
  /// left-joined with its cached geo row. The visitor returns false to stop.
  async fn scan_brute_attempts(
    &self,
    updated_after: DateTime<Utc>,
    visitor: ScanVisitor<'_>,
  ) -> Result<(), StorageError>;
}

/// Open the store selected by the database config.
pub async fn connect(cfg: &config::Database) -> Result<Arc<dyn Store>, StorageError> {
  return match cfg.driver {
    config::Driver::Sqlite => Ok(Arc::new(SqliteStore::open(&cfg.dsn).await?)),
    config::Driver::Postgres => Ok(Arc::new(PostgresStore::connect(&cfg.dsn).await?)),
  };
}
