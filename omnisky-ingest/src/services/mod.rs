//! Collaborators the pipeline drives through narrow interfaces
//!
//! - `dedup`: content hashing and event family signatures
//! - `downloader`: fetch a target's bytes to a local path
//! - `analyzer`: classify a downloaded file
//! - `cleanup`: remove or quarantine raw files

pub mod analyzer;
pub mod cleanup;
pub mod dedup;
pub mod downloader;

pub use analyzer::{AnalyzeError, Analyzer, CommandAnalyzer, PassthroughAnalyzer};
pub use cleanup::{Cleanup, FsCleanup};
pub use dedup::{content_hash, hash_file, signature, StreamingHasher};
pub use downloader::{DownloadError, DownloadedFile, Downloader, HttpDownloader};
