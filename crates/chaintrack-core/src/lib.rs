//! chaintrack-core: reorg-aware block tracking and log synchronization.
//!
//! # Architecture
//!
//! ```text
//! HeadSource (poll / push) → BlockTracker ──publish──→ BlockStream ──→ subscribers
//!                                 │  (window of recent blocks)         │
//!                                 └──────────── EventTracker ←─────────┘
//!                                                ├── ChainProvider (blocks, logs)
//!                                                ├── FastTrack     (first block hint)
//!                                                └── LogStore      (memory / SQLite)
//! ```

pub mod config;
pub mod error;
pub mod event_tracker;
pub mod fasttrack;
pub mod head;
pub mod provider;
pub mod serde_helpers;
pub mod store;
pub mod stream;
pub mod tracker;
pub mod types;

pub use config::{TrackerConfig, TrackerState};
pub use error::{ProviderError, TrackerError};
pub use event_tracker::EventTracker;
pub use fasttrack::{FastTrack, StaticFastTrack};
pub use head::{HeadHandler, HeadSource, HeadSubscriber, HeadSubscription, PollingHeadSource, PushHeadSource};
pub use provider::{BlockTag, ChainProvider, LogQuery, LogSelector};
pub use store::{Entry, LogStore, MemoryLogStore};
pub use stream::{BlockStream, Broker, Subscription};
pub use tracker::{BlockTracker, BlockWindow};
pub use types::{Block, BlockEvent, Event, FilterConfig, GenesisRecord, Log};
