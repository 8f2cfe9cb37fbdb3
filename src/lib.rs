//! # redo-capture
//!
//! A change-data-capture engine that reads a relational database's
//! binary redo stream, reconstructs row-level changes grouped into their
//! originating transactions, and emits them downstream in commit order
//! as self-describing JSON messages.
//!
//! ## Overview
//!
//! The pipeline reads fixed-size redo blocks (verifying checksums and
//! sequence continuity), decodes LWN write groups into typed change
//! vectors, buffers them per transaction in a bounded memory arena with
//! disk spill, and on COMMIT replays each transaction through the output
//! builder into a writer sink. Progress is checkpointed so replication
//! resumes after a crash without gaps or duplicates:
//!
//! - **Exactly-once output** per committed transaction, fenced by
//!   checkpoints
//! - **Bounded memory** with per-module quotas and transaction swap
//! - **Deterministic ordering**: commits surface in `(scn, lwn-index)`
//!   order and restarts reproduce the identical byte stream
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use redo_capture::{Config, Replicator, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load("redo-capture.json")?;
//!     let mut replicator = Replicator::new(config, None);
//!     replicator.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`replicator`] - Pipeline supervisor: task wiring and shutdown
//! - [`redo`] - Block reader, LWN parser, LOB assembly, numeric decode
//! - [`transaction`] - Per-XID buffering with swap support
//! - [`memory`] - Chunk arena with per-module quotas
//! - [`schema`] - Catalog mirror with the uncommitted DDL overlay
//! - [`builder`] - Output ring and JSON serialization
//! - [`writer`] - Downstream sinks
//! - [`checkpoint`] - Progress persistence and recovery
//! - [`config`] - Configuration structures and validation
//! - [`error`] - Error types and handling

pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod memory;
pub mod redo;
pub mod replicator;
pub mod schema;
pub mod transaction;
pub mod types;
pub mod writer;

pub use config::Config;
pub use error::{Error, Result};
pub use replicator::Replicator;
