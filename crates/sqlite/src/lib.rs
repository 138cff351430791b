#![allow(clippy::needless_return)]

mod connection;
mod error;
mod params;
mod rows;

pub use connection::Connection;
pub use error::Error;
pub use params::Params;
pub use rows::{Row, Rows};

pub use rusqlite::types::Value;

/// The result returned on method calls in this crate.
pub type Result<T> = std::result::Result<T, Error>;
