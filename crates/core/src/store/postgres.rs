use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::str::FromStr;
use tokio_postgres::NoTls;

use super::{
  AbuseipdbReport, AttemptEvent, AttemptKind, BruteAttempt, IpGeo, ScanVisitor, StorageError,
  Store,
};

const SCHEMA: &str = r#"
  CREATE TABLE IF NOT EXISTS brute_attempts (
    id              BIGSERIAL PRIMARY KEY,
    ip              TEXT NOT NULL,
    kind            BIGINT NOT NULL,
    "user"          TEXT NOT NULL DEFAULT '',
    password        TEXT NOT NULL DEFAULT '',
    client_version  TEXT NOT NULL DEFAULT '',
    started_at      TIMESTAMPTZ NOT NULL,
    stopped_at      TIMESTAMPTZ NOT NULL,
    count           BIGINT NOT NULL DEFAULT 0,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
  );
  CREATE INDEX IF NOT EXISTS brute_attempts_ip_kind ON brute_attempts (ip, kind);
  CREATE INDEX IF NOT EXISTS brute_attempts_updated_at ON brute_attempts (updated_at);

  CREATE TABLE IF NOT EXISTS ip_geos (
    ip              TEXT PRIMARY KEY,
    location        TEXT NOT NULL DEFAULT '',
    latitude        DOUBLE PRECISION NOT NULL DEFAULT 0,
    longitude       DOUBLE PRECISION NOT NULL DEFAULT 0,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
  );

  CREATE TABLE IF NOT EXISTS abuseipdb_reports (
    id              BIGSERIAL PRIMARY KEY,
    ip              TEXT NOT NULL,
    reported_at     TIMESTAMPTZ NOT NULL,
    score           BIGINT NOT NULL DEFAULT 0,
    created_at      TIMESTAMPTZ NOT NULL
  );
  CREATE INDEX IF NOT EXISTS abuseipdb_reports_ip ON abuseipdb_reports (ip);
"#;

/// Postgres-backed store. The merge transaction locks the current row with
/// `SELECT ... FOR UPDATE`, so concurrent merges for the same `(ip, kind)`
/// serialize on the row lock.
pub struct PostgresStore {
  pool: Pool,
}

impl PostgresStore {
  pub async fn connect(dsn: &str) -> Result<Self, StorageError> {
    let pg_config = tokio_postgres::Config::from_str(dsn)
      .map_err(|err| StorageError::InvalidDsn(err.to_string()))?;

    let manager = Manager::from_config(
      pg_config,
      NoTls,
      ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
      },
    );
    let pool = Pool::builder(manager).max_size(4).build()?;

    let client = pool.get().await?;
    client.batch_execute(SCHEMA).await?;

    return Ok(PostgresStore { pool });
  }
}

fn attempt_from_row(row: &tokio_postgres::Row) -> Result<BruteAttempt, StorageError> {
  let kind_value: i64 = row.try_get(2)?;
  let kind = AttemptKind::from_i64(kind_value)
    .ok_or_else(|| StorageError::CorruptRow(format!("unknown attempt kind {kind_value}")))?;

  return Ok(BruteAttempt {
    id: row.try_get(0)?,
    ip: row.try_get(1)?,
    kind,
    user: row.try_get(3)?,
    password: row.try_get(4)?,
    client_version: row.try_get(5)?,
    started_at: row.try_get(6)?,
    stopped_at: row.try_get(7)?,
    count: row.try_get(8)?,
    created_at: row.try_get(9)?,
    updated_at: row.try_get(10)?,
  });
}

#[async_trait]
impl Store for PostgresStore {
  async fn incr_brute_attempt(&self, event: AttemptEvent) -> Result<BruteAttempt, StorageError> {
    let event = event.truncated();
    let now = Utc::now();

    let mut client = self.pool.get().await?;
    let tx = client.transaction().await?;

    let last = tx
      .query_opt(
        r#"SELECT id, started_at, stopped_at, count, created_at FROM brute_attempts
           WHERE ip = $1 AND kind = $2 ORDER BY id DESC LIMIT 1 FOR UPDATE"#,
        &[&event.ip, &(event.kind as i64)],
      )
      .await?;

    let current = match last {
      Some(row) => {
        let stopped_at: DateTime<Utc> = row.try_get(2)?;
        if stopped_at > event.not_before {
          Some((
            row.try_get::<_, i64>(0)?,
            row.try_get::<_, DateTime<Utc>>(1)?,
            row.try_get::<_, i64>(3)?,
            row.try_get::<_, DateTime<Utc>>(4)?,
          ))
        } else {
          None
        }
      }
      None => None,
    };

    let attempt = match current {
      Some((id, started_at, count, created_at)) => {
        tx.execute(
          r#"UPDATE brute_attempts
             SET "user" = $1, password = $2, client_version = $3, stopped_at = $4,
                 count = $5, updated_at = $6
             WHERE id = $7"#,
          &[
            &event.user,
            &event.password,
            &event.client_version,
            &event.time,
            &(count + 1),
            &now,
            &id,
          ],
        )
        .await?;

        BruteAttempt {
          id,
          ip: event.ip,
          kind: event.kind,
          user: event.user,
          password: event.password,
          client_version: event.client_version,
          started_at,
          stopped_at: event.time,
          count: count + 1,
          created_at,
          updated_at: now,
        }
      }
      None => {
        let row = tx
          .query_one(
            r#"INSERT INTO brute_attempts
                 (ip, kind, "user", password, client_version, started_at, stopped_at,
                  count, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $6, 1, $7, $7)
               RETURNING id"#,
            &[
              &event.ip,
              &(event.kind as i64),
              &event.user,
              &event.password,
              &event.client_version,
              &event.time,
              &now,
            ],
          )
          .await?;

        BruteAttempt {
          id: row.try_get(0)?,
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

    tx.commit().await?;
    return Ok(attempt);
  }

  async fn last_abuseipdb_report(
    &self,
    ip: &str,
  ) -> Result<Option<AbuseipdbReport>, StorageError> {
    let client = self.pool.get().await?;
    let row = client
      .query_opt(
        "SELECT id, ip, reported_at, score, created_at FROM abuseipdb_reports
         WHERE ip = $1 ORDER BY reported_at DESC LIMIT 1",
        &[&ip],
      )
      .await?;

    let Some(row) = row else {
      return Ok(None);
    };

    return Ok(Some(AbuseipdbReport {
      id: row.try_get(0)?,
      ip: row.try_get(1)?,
      reported_at: row.try_get(2)?,
      score: row.try_get(3)?,
      created_at: row.try_get(4)?,
    }));
  }

  async fn take_ip_geo(&self, ip: &str) -> Result<Option<IpGeo>, StorageError> {
    let client = self.pool.get().await?;
    let row = client
      .query_opt(
        "SELECT ip, location, latitude, longitude, created_at, updated_at FROM ip_geos
         WHERE ip = $1",
        &[&ip],
      )
      .await?;

    let Some(row) = row else {
      return Ok(None);
    };

    return Ok(Some(IpGeo {
      ip: row.try_get(0)?,
      location: row.try_get(1)?,
      latitude: row.try_get(2)?,
      longitude: row.try_get(3)?,
      created_at: row.try_get(4)?,
      updated_at: row.try_get(5)?,
    }));
  }

  async fn save_ip_geo(&self, geo: &IpGeo) -> Result<(), StorageError> {
    let client = self.pool.get().await?;
    client
      .execute(
        "INSERT INTO ip_geos (ip, location, latitude, longitude, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (ip) DO UPDATE SET
           location = EXCLUDED.location,
           latitude = EXCLUDED.latitude,
           longitude = EXCLUDED.longitude,
           created_at = EXCLUDED.created_at,
           updated_at = EXCLUDED.updated_at",
        &[
          &geo.ip,
          &crate::util::truncate_str(&geo.location, super::MAX_FIELD_BYTES),
          &geo.latitude,
          &geo.longitude,
          &geo.created_at,
          &geo.updated_at,
        ],
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
    let client = self.pool.get().await?;
    client
      .execute(
        "INSERT INTO abuseipdb_reports (ip, reported_at, score, created_at)
         VALUES ($1, $2, $3, $4)",
        &[&ip, &reported_at, &score, &Utc::now()],
      )
      .await?;
    return Ok(());
  }

  async fn scan_brute_attempts(
    &self,
    updated_after: DateTime<Utc>,
    visitor: ScanVisitor<'_>,
  ) -> Result<(), StorageError> {
    let client = self.pool.get().await?;
    let rows = client
      .query(
        r#"SELECT a.id, a.ip, a.kind, a."user", a.password, a.client_version,
                  a.started_at, a.stopped_at, a.count, a.created_at, a.updated_at,
                  g.ip, g.location, g.latitude, g.longitude, g.created_at, g.updated_at
           FROM brute_attempts a
           LEFT JOIN ip_geos g ON a.ip = g.ip
           WHERE a.updated_at > $1
           ORDER BY a.updated_at ASC"#,
        &[&updated_after],
      )
      .await?;

    for row in &rows {
      let attempt = attempt_from_row(row)?;

      let geo = match row.try_get::<_, Option<String>>(11)? {
        Some(geo_ip) => Some(IpGeo {
          ip: geo_ip,
          location: row.try_get(12)?,
          latitude: row.try_get(13)?,
          longitude: row.try_get(14)?,
          created_at: row.try_get(15)?,
          updated_at: row.try_get(16)?,
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
