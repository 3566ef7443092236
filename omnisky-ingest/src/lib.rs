//! omnisky-ingest library interface
//!
//! Discovery, the three-stage download → analyze → persist pipeline, the
//! resource-aware daemon loop and its observability files. The binary in
//! `main.rs` wires these together; integration tests drive them directly.

pub mod config;
pub mod daemon;
pub mod db;
pub mod discovery;
pub mod error;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod services;
pub mod sources;
pub mod utils;

pub use crate::error::{IngestError, IngestResult};
