//! # OmniSky Common Library
//!
//! Shared code for the OmniSky ingest daemon and its tooling:
//! - Error and result types
//! - Root folder resolution and TOML configuration loading
//! - SQLite pool initialization and ordered schema migrations
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};
