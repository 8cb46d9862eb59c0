//! Durable storage: sync watermarks, the context corpus and settings.

pub mod db;

pub use db::{CorpusStats, DbHandle, EnhancerDb};
