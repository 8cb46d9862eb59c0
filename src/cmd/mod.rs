//! CLI command implementations.
//!
//! | Module       | Commands handled       |
//! |--------------|------------------------|
//! | `serve`      | `Serve`                |
//! | `sync`       | `Sync`, `Status`       |
//! | `connectors` | `Connectors`           |

pub mod connectors;
pub mod serve;
pub mod sync;

pub use connectors::cmd_connectors;
pub use serve::cmd_serve;
pub use sync::{cmd_status, cmd_sync};
