//! issue-enhancer: keeps a local corpus of chat, document, email and code
//! context in sync and uses it to enrich newly created issues.

pub mod config;
pub mod discovery;
pub mod enhance;
pub mod errors;
pub mod server;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod tracker;
pub mod upstream;
pub mod webhook;
