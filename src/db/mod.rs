mod connection;
pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::Database;
pub use helpers::{is_fatal_store_error, DatabaseUnavailable};
pub use models::{StoredTag, TagReading};
