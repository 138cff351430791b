use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};
use std::path::Path;

use super::{
  AbuseipdbReport, AttemptEvent, AttemptKind, BruteAttempt, IpGeo, ScanVisitor, StorageError,
  Store,
};

const SCHEMA: &str = r#"
  CREATE TABLE IF NOT EXISTS brute_attempts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    ip              TEXT NOT NULL,
    kind            INTEGER NOT NULL,
    user            TEXT NOT NULL DEFAULT '',
    password        TEXT NOT NULL DEFAULT '',
    client_version  TEXT NOT NULL DEFAULT '',
    started_at      INTEGER NOT NULL,
    stopped_at      INTEGER NOT NULL,
    count           INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
  );
  CREATE INDEX IF NOT EXISTS brute_attempts_ip_kind ON brute_attempts (ip, kind);
  CREATE INDEX IF NOT EXISTS brute_attempts_updated_at ON brute_attempts (updated_at);

  CREATE TABLE IF NOT EXISTS ip_geos (
    ip              TEXT PRIMARY KEY,
    location        TEXT NOT NULL DEFAULT '',
    latitude        REAL NOT NULL DEFAULT 0,
    longitude       REAL NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
  );

  CREATE TABLE IF NOT EXISTS abuseipdb_reports (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    ip              TEXT NOT NULL,
    reported_at     INTEGER NOT NULL,
    score           INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL
  );
  CREATE INDEX IF NOT EXISTS abuseipdb_reports_ip ON abuseipdb_reports (ip);
"#;

/// SQLite-backed store. A single connection on a background thread; the merge
/// transaction runs `BEGIN IMMEDIATE`, so concurrent merges for the same
/// `(ip, kind)` serialize on the database write lock.
pub struct SqliteStore {
  conn: funeypot_sqlite::Connection,
}

impl SqliteStore {
  pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
    let conn = funeypot_sqlite::Connection::open(path).await?;
    return Self::with_connection(conn).await;
  }

  pub async fn open_in_memory() -> Result<Self, StorageError> {
    let conn = funeypot_sqlite::Connection::open_in_memory().await?;
    return Self::with_connection(conn).await;
  }

  async fn with_connection(conn: funeypot_sqlite::Connection) -> Result<Self, StorageError> {
    conn.execute_batch(SCHEMA).await?;
    return Ok(SqliteStore { conn });
  }
}

fn millis(t: DateTime<Utc>) -> i64 {
  return t.timestamp_millis();
}

fn datetime(ms: i64) -> DateTime<Utc> {
  return DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
}

fn col<T: rusqlite::types::FromSql>(
  row: &funeypot_sqlite::Row,
  idx: usize,
) -> Result<T, StorageError> {
  return row
    .get::<T>(idx)
    .map_err(|err| StorageError::CorruptRow(format!("column {idx}: {err}")));
}

fn attempt_from_row(row: &funeypot_sqlite::Row) -> Result<BruteAttempt, StorageError> {
  let kind_value: i64 = col(row, 2)?;
  let kind = AttemptKind::from_i64(kind_value)
    .ok_or_else(|| StorageError::CorruptRow(format!("unknown attempt kind {kind_value}")))?;

  return Ok(BruteAttempt {
    id: col(row, 0)?,
    ip: col(row, 1)?,
    kind,
    user: col(row, 3)?,
    password: col(row, 4)?,
    client_version: col(row, 5)?,
    started_at: datetime(col(row, 6)?),
    stopped_at: datetime(col(row, 7)?),
    count: col(row, 8)?,
    created_at: datetime(col(row, 9)?),
    updated_at: datetime(col(row, 10)?),
  });
}

#[async_trait]
impl Store for SqliteStore {
  async fn incr_brute_attempt(&self, event: AttemptEvent) -> Result<BruteAttempt, StorageError> {
    let event = event.truncated();
    let now = Utc::now();

    let attempt = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last = tx
          .query_row(
            "SELECT id, started_at, stopped_at, count, created_at FROM brute_attempts
             WHERE ip = ?1 AND kind = ?2 ORDER BY id DESC LIMIT 1",
            rusqlite::params![event.ip, event.kind as i64],
            |row| {
              Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
              ))
            },
          )
          .optional()?;

        let attempt = match last {
          Some((id, started_at, stopped_at, count, created_at))
            if stopped_at > millis(event.not_before) =>
          {
            tx.execute(
              "UPDATE brute_attempts
               SET user = ?1, password = ?2, client_version = ?3, stopped_at = ?4,
                   count = ?5, updated_at = ?6
               WHERE id = ?7",
              rusqlite::params![
                event.user,
                event.password,
                event.client_version,
                millis(event.time),
                count + 1,
                millis(now),
                id
              ],
            )?;

            BruteAttempt {
              id,
              ip: event.ip,
              kind: event.kind,
              user: event.user,
              password: event.password,
              client_version: event.client_version,
              started_at: datetime(started_at),
              stopped_at: event.time,
              count: count + 1,
              created_at: datetime(created_at),
              updated_at: now,
            }
          }
          _ => {
            tx.execute(
              "INSERT INTO brute_attempts
                 (ip, kind, user, password, client_version, started_at, stopped_at,
                  count, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
              rusqlite::params![
                event.ip,
                event.kind as i64,
                event.user,
                event.password,
                event.client_version,
                millis(event.time),
                millis(event.time),
                millis(now)
              ],
            )?;

            BruteAttempt {
              id: tx.last_insert_rowid(),
              ip: event.ip,
              kind: event.kind,
              user: event.user,
              password: event.password,
              client_version: event.client_version,
              started_at: event.time,
              stopped_at: event.time,
              count: 1,
              created_at: now,
              updated_at: now,
            }
          }
        };

        tx.commit()?;
        Ok(attempt)
      })
      .await?;

    return Ok(attempt);
  }

  async fn last_abuseipdb_report(
    &self,
    ip: &str,
  ) -> Result<Option<AbuseipdbReport>, StorageError> {
    let row = self
      .conn
      .query_row(
        "SELECT id, ip, reported_at, score, created_at FROM abuseipdb_reports
         WHERE ip = ?1 ORDER BY reported_at DESC LIMIT 1",
        (ip.to_string(),),
      )
      .await?;

    let Some(row) = row else {
      return Ok(None);
    };

    return Ok(Some(AbuseipdbReport {
      id: col(&row, 0)?,
      ip: col(&row, 1)?,
      reported_at: datetime(col(&row, 2)?),
      score: col(&row, 3)?,
      created_at: datetime(col(&row, 4)?),
    }));
  }

  async fn take_ip_geo(&self, ip: &str) -> Result<Option<IpGeo>, StorageError> {
    let row = self
      .conn
      .query_row(
        "SELECT ip, location, latitude, longitude, created_at, updated_at FROM ip_geos
         WHERE ip = ?1",
        (ip.to_string(),),
      )
      .await?;

    let Some(row) = row else {
      return Ok(None);
    };

    return Ok(Some(IpGeo {
      ip: col(&row, 0)?,
      location: col(&row, 1)?,
      latitude: col(&row, 2)?,
      longitude: col(&row, 3)?,
      created_at: datetime(col(&row, 4)?),
      updated_at: datetime(col(&row, 5)?),
    }));
  }

  async fn save_ip_geo(&self, geo: &IpGeo) -> Result<(), StorageError> {
    self
      .conn
      .execute(
        "INSERT INTO ip_geos (ip, location, latitude, longitude, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (ip) DO UPDATE SET
           location = excluded.location,
           latitude = excluded.latitude,
           longitude = excluded.longitude,
           created_at = excluded.created_at,
           updated_at = excluded.updated_at",
        funeypot_sqlite::params!(
          geo.ip.clone(),
          crate::util::truncate_str(&geo.location, super::MAX_FIELD_BYTES),
          geo.latitude,
          geo.longitude,
          millis(geo.created_at),
          millis(geo.updated_at)
        ),
      )
      .await?;
    return Ok(());
  }

  async fn create_abuseipdb_report(
    &self,
    ip: &str,
    reported_at: DateTime<Utc>,
    score: i64,
  ) -> Result<(), StorageError> {
    self
      .conn
      .execute(
        "INSERT INTO abuseipdb_reports (ip, reported_at, score, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        funeypot_sqlite::params!(
          ip.to_string(),
          millis(reported_at),
          score,
          millis(Utc::now())
        ),
      )
      .await?;
    return Ok(());
  }

  async fn scan_brute_attempts(
    &self,
    updated_after: DateTime<Utc>,
    visitor: ScanVisitor<'_>,
  ) -> Result<(), StorageError> {
    let rows = self
      .conn
      .query(
        "SELECT a.id, a.ip, a.kind, a.user, a.password, a.client_version,
                a.started_at, a.stopped_at, a.count, a.created_at, a.updated_at,
                g.ip, g.location, g.latitude, g.longitude, g.created_at, g.updated_at
         FROM brute_attempts a
         LEFT JOIN ip_geos g ON a.ip = g.ip
         WHERE a.updated_at > ?1
         ORDER BY a.updated_at ASC",
        (millis(updated_after),),
      )
      .await?;

    for row in rows.iter() {
      let attempt = attempt_from_row(row)?;

      let geo = match col::<Option<String>>(row, 11)? {
        Some(geo_ip) => Some(IpGeo {
          ip: geo_ip,
          location: col(row, 12)?,
          latitude: col(row, 13)?,
          longitude: col(row, 14)?,
          created_at: datetime(col(row, 15)?),
          updated_at: datetime(col(row, 16)?),
        }),
        None => None,
      };

      if !visitor(&attempt, geo.as_ref()) {
        break;
      }
    }

    return Ok(());
  }
}
