//! Core domain + application logic for the RAG Telegram bot backend.
//!
//! This crate is intentionally framework-agnostic. Telegram, SQLite and the
//! message bus live behind ports (traits) implemented in adapter crates.

pub mod alerting;
pub mod bus;
pub mod config;
pub mod domain;
pub mod errors;
pub mod guard;
pub mod jobs;
pub mod logging;
pub mod messaging;
pub mod payments;
pub mod pipeline;
pub mod ports;
pub mod scheduler;
pub mod status;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use errors::{Error, Result};
