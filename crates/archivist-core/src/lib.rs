//! Core types and trait definitions for the Archivist historian archive.
//!
//! This crate is deliberately free of database dependencies. It owns the
//! hierarchy model, the formula compiler and evaluator, the derived-rule
//! registry and the [`store::HistorianStore`] abstraction that storage
//! backends implement.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod archive;
pub mod error;
pub mod formula;
pub mod hierarchy;
pub mod registry;
pub mod report;
pub mod snapshot;
pub mod store;

pub use error::{Error, Result};
