//! Buffer management for the streaming pipeline.

pub mod history;
pub mod pool;

pub use history::LoadHistory;
pub use pool::{DecodedChunk, DecodedChunkPool, PoolStats};
