//! Shared domain types for issue-enhancer.
//!
//! Everything that crosses the boundary between the sync layer, the
//! enhancement pipeline and the connector implementations lives here so that
//! connectors can be written (and faked in tests) without pulling in the
//! server, storage or HTTP stacks.

pub mod connector;
pub mod record;
pub mod repo;
pub mod watermark;

pub use connector::{
    Connector, ConnectorError, FetchOutcome, Fetched, PartialSync, RecordSink, materialize_in_order,
};
pub use record::{ContextRecord, SourceKind, Visibility};
pub use repo::RepoMetadata;
pub use watermark::{Cursor, SyncWatermark, WatermarkSet};
