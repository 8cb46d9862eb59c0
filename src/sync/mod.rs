//! Incremental sync of external sources into the local corpus.

pub mod allow_list;
pub mod connectors;
pub mod orchestrator;
pub mod state;

pub use allow_list::{AddressBook, AllowList, AllowListEntry, AllowReason};
pub use orchestrator::{ConnectorReport, ConnectorStatus, SyncOrchestrator, SyncReport};
pub use state::{SyncStateStore, SyncStatus, WatermarkView};
