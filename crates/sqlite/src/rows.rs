use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, Value};

/// Rows read eagerly on the connection thread, so no statement handle ever
/// outlives its closure. Values are accessed by column index; the store
/// selects columns explicitly and knows their positions.
#[derive(Debug)]
pub struct Rows(Vec<Row>);

impl Rows {
  pub(crate) fn collect(mut rows: rusqlite::Rows) -> crate::Result<Self> {
    let column_count = rows.as_ref().map_or(0, |stmt| stmt.column_count());

    let mut collected = vec![];
    while let Some(row) = rows.next()? {
      collected.push(Row::read(row, column_count)?);
    }
    return Ok(Rows(collected));
  }

  pub fn len(&self) -> usize {
    return self.0.len();
  }

  pub fn is_empty(&self) -> bool {
    return self.0.is_empty();
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Row> {
    return self.0.iter();
  }
}

impl IntoIterator for Rows {
  type Item = Row;
  type IntoIter = std::vec::IntoIter<Row>;

  fn into_iter(self) -> Self::IntoIter {
    return self.0.into_iter();
  }
}

/// One row, detached from its statement.
#[derive(Debug)]
pub struct Row(Vec<Value>);

impl Row {
  fn read(row: &rusqlite::Row, column_count: usize) -> rusqlite::Result<Self> {
    let values = (0..column_count)
      .map(|idx| Ok(row.get_ref(idx)?.into()))
      .collect::<rusqlite::Result<Vec<Value>>>()?;
    return Ok(Row(values));
  }

  /// Decode the value at column `idx`.
  pub fn get<T>(&self, idx: usize) -> FromSqlResult<T>
  where
    T: FromSql,
  {
    let Some(value) = self.0.get(idx) else {
      return Err(FromSqlError::OutOfRange(idx as i64));
    };
    return T::column_result(value.into());
  }
}
