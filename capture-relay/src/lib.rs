//! Capture Relay Library
//!
//! Receives batches of newly captured answer text and keeps a bounded,
//! persistent history of them for later inspection.

pub mod payload;
pub mod server;
pub mod storage;

pub use payload::{ExtractedBatch, RelayAck, RelayMessage, UnitRecord};
pub use server::{RelayConfig, RelayServer};
pub use storage::{HistoryEntry, HistoryLog, StorageError};
