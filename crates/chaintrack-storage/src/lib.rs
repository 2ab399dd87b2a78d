//! chaintrack-storage: persistent log store backends for ChainTrack.
//!
//! Backends:
//! - `MemoryLogStore` in `chaintrack-core` (no persistence)
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteEntry, SqliteLogStore};
