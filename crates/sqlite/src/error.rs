#[derive(thiserror::Error, Debug)]
pub enum Error {
  /// The connection thread is gone, taking any in-flight work with it.
  #[error("Connection closed")]
  ConnectionClosed,

  #[error("Rusqlite error: {0}")]
  Rusqlite(#[from] rusqlite::Error),
}
