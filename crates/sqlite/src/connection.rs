use crossbeam_channel::Sender;
use std::fmt::{self, Debug};
use std::path::Path;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::params::Params;
use crate::rows::{Row, Rows};
use crate::Result;

type Job = Box<dyn FnOnce(&mut rusqlite::Connection) + Send + 'static>;

/// Handle to a SQLite connection owned by a dedicated background thread.
///
/// Closures shipped through [`Connection::call`] run on that thread one after
/// another, so writes serialize. The handle is cheap to clone and every clone
/// feeds the same connection; once the last clone drops, the thread drains
/// its queue and the database closes with it.
#[derive(Clone)]
pub struct Connection {
  jobs: Sender<Job>,
}

impl Connection {
  /// Open the database at `path`, creating it if needed.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    return start(move || rusqlite::Connection::open(path)).await;
  }

  /// Open a fresh in-memory database.
  pub async fn open_in_memory() -> Result<Self> {
    return start(rusqlite::Connection::open_in_memory).await;
  }

  /// Run `function` on the connection thread and await its result.
  ///
  /// # Failure
  ///
  /// Will return `Err` if the connection thread has shut down.
  pub async fn call<F, R>(&self, function: F) -> Result<R>
  where
    F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
    R: Send + 'static,
  {
    let (tx, rx) = oneshot::channel::<Result<R>>();

    let job: Job = Box::new(move |conn| {
      let _ = tx.send(function(conn));
    });
    self.jobs.send(job).map_err(|_| Error::ConnectionClosed)?;

    return rx.await.map_err(|_| Error::ConnectionClosed)?;
  }

  /// Run a statement and collect every row it returns.
  pub async fn query(&self, sql: &str, params: impl Params + Send + 'static) -> Result<Rows> {
    let sql = sql.to_string();
    return self
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        params.bind(&mut stmt)?;
        return Rows::collect(stmt.raw_query());
      })
      .await;
  }

  /// Run a statement and return its first row, if any.
  pub async fn query_row(
    &self,
    sql: &str,
    params: impl Params + Send + 'static,
  ) -> Result<Option<Row>> {
    return Ok(self.query(sql, params).await?.into_iter().next());
  }

  /// Run a single statement, returning the number of affected rows.
  pub async fn execute(&self, sql: &str, params: impl Params + Send + 'static) -> Result<usize> {
    let sql = sql.to_string();
    return self
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        params.bind(&mut stmt)?;
        return Ok(stmt.raw_execute()?);
      })
      .await;
  }

  /// Run several `;`-separated statements, discarding any rows they return.
  pub async fn execute_batch(&self, sql: &str) -> Result<()> {
    let sql = sql.to_string();
    return self.call(move |conn| Ok(conn.execute_batch(&sql)?)).await;
  }
}

impl Debug for Connection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connection").finish()
  }
}

/// Spawn the connection thread: open, tune, then serve jobs until every
/// handle is gone.
async fn start<F>(open: F) -> Result<Connection>
where
  F: FnOnce() -> rusqlite::Result<rusqlite::Connection> + Send + 'static,
{
  let (jobs, queue) = crossbeam_channel::unbounded::<Job>();
  let (ready_tx, ready_rx) = oneshot::channel::<rusqlite::Result<()>>();

  std::thread::spawn(move || {
    let mut conn = match open().and_then(|conn| {
      tune(&conn)?;
      Ok(conn)
    }) {
      Ok(conn) => conn,
      Err(err) => {
        let _ = ready_tx.send(Err(err));
        return;
      }
    };

    if ready_tx.send(Ok(())).is_err() {
      return;
    }

    while let Ok(job) = queue.recv() {
      job(&mut conn);
    }
    // All handles dropped; the database closes when `conn` does.
  });

  return match ready_rx.await {
    Ok(Ok(())) => Ok(Connection { jobs }),
    Ok(Err(err)) => Err(err.into()),
    Err(_) => Err(Error::ConnectionClosed),
  };
}

/// Service-lifetime tuning: WAL journaling, relaxed syncing, a busy timeout
/// well past any transaction this crate runs.
fn tune(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
  // NOTE: executed as a batch since some pragmas return rows.
  return conn.execute_batch(
    r#"
      PRAGMA busy_timeout       = 10000;
      PRAGMA journal_mode       = WAL;
      PRAGMA journal_size_limit = 200000000;
      PRAGMA synchronous        = NORMAL;
      PRAGMA foreign_keys       = ON;
      PRAGMA temp_store         = MEMORY;
      PRAGMA cache_size         = -16000;
    "#,
  );
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::params;

  #[tokio::test]
  async fn call_test() {
    let conn = Connection::open_in_memory().await.unwrap();

    let result = conn
      .call(|conn| {
        conn
          .execute(
            "CREATE TABLE person (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
            [],
          )
          .map_err(|e| e.into())
      })
      .await;

    assert_eq!(0, result.unwrap());

    let result = conn
      .call(|conn| conn.execute("Invalid sql", []).map_err(|e| e.into()))
      .await;
    assert!(matches!(result, Err(Error::Rusqlite(_))));
  }

  #[tokio::test]
  async fn query_test() {
    let tmp_dir = tempfile::TempDir::new().unwrap();
    let conn = Connection::open(tmp_dir.path().join("main.db"))
      .await
      .unwrap();

    conn
      .execute("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT)", ())
      .await
      .unwrap();
    conn
      .execute(
        "INSERT INTO test (id, name) VALUES (?1, ?2)",
        params!(7i64, "seven".to_string()),
      )
      .await
      .unwrap();

    let row = conn
      .query_row("SELECT id, name FROM test", ())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(row.get::<i64>(0).unwrap(), 7);
    assert_eq!(row.get::<String>(1).unwrap(), "seven");

    let rows = conn.query("SELECT id FROM test WHERE id > ?1", (0,)).await;
    assert_eq!(rows.unwrap().len(), 1);

    assert!(conn
      .query_row("SELECT id FROM test WHERE id = ?1", (8,))
      .await
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn clones_share_one_connection_test() {
    let conn = Connection::open_in_memory().await.unwrap();
    conn
      .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", ())
      .await
      .unwrap();

    let clone = conn.clone();
    clone.execute("INSERT INTO t (id) VALUES (1)", ()).await.unwrap();

    let rows = conn.query("SELECT id FROM t", ()).await.unwrap();
    assert_eq!(rows.len(), 1);
  }
}
