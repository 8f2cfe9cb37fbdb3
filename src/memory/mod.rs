//! Bounded memory management for the pipeline.
//!
//! All large buffers (read-ahead blocks, transaction chunks, builder
//! queue nodes) come from a single arena of fixed-size chunks with
//! per-module quotas. Under pressure, transaction chunks are spilled to
//! per-transaction swap files and read back during replay.

mod arena;
mod swap;

pub use arena::{Chunk, MemoryArena, Module, CHUNK_SIZE, CHUNK_SIZE_MB};
pub use swap::SwapSpace;
