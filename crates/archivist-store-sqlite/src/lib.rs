//! SQLite backend for the Archivist historian archive.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. The derived-attribute engine runs
//! in-process: registrations live in a table, and every connection keeps a
//! cached [`Registry`](archivist_core::registry::Registry) that is refreshed
//! whenever another connection changes them.

mod archive;
mod derived;
mod encode;
mod engine;
mod hierarchy;
mod reload;
mod schema;
mod store;

pub mod config;
pub mod error;

pub use config::{JournalMode, StoreConfig};
pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
