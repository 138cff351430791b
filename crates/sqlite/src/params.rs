use rusqlite::types::Value;
use rusqlite::Statement;

/// Positional statement parameters. Only the shapes the callers actually
/// bind exist: no parameters, a single `ToSql` value, or an owned `Value`
/// array built by [`params!`](crate::params).
pub trait Params {
  fn bind(self, stmt: &mut Statement<'_>) -> rusqlite::Result<()>;
}

impl Params for () {
  fn bind(self, _stmt: &mut Statement<'_>) -> rusqlite::Result<()> {
    return Ok(());
  }
}

impl<T> Params for (T,)
where
  T: rusqlite::ToSql + Send + Sync,
{
  fn bind(self, stmt: &mut Statement<'_>) -> rusqlite::Result<()> {
    return stmt.raw_bind_parameter(1, self.0);
  }
}

impl<const N: usize> Params for [Value; N] {
  fn bind(self, stmt: &mut Statement<'_>) -> rusqlite::Result<()> {
    for (idx, value) in self.into_iter().enumerate() {
      stmt.raw_bind_parameter(idx + 1, value)?;
    }
    return Ok(());
  }
}

/// Convert positional params into an owned `[Value; N]` array, so the
/// statement can be shipped to the connection thread.
#[macro_export]
macro_rules! params {
    ($($param:expr),+ $(,)?) => {
        [$(Into::<$crate::Value>::into($param)),+]
    };
}
