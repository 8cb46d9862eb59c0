use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::watermark::Cursor;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Chat,
    Document,
    Email,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Document => "document",
            Self::Email => "email",
        }
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            "document" => Ok(Self::Document),
            "email" => Ok(Self::Email),
            _ => Err(format!("Invalid source kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Internal,
    External,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
        }
    }

    /// Tag an author address by whether its domain is one of `internal_domains`.
    /// Records without a known address are treated as external.
    pub fn for_address(address: Option<&str>, internal_domains: &[String]) -> Self {
        let Some(domain) = address.and_then(|a| a.rsplit_once('@')).map(|(_, d)| d) else {
            return Self::External;
        };
        if internal_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
        {
            Self::Internal
        } else {
            Self::External
        }
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(Self::Internal),
            "external" => Ok(Self::External),
            _ => Err(format!("Invalid visibility: {}", s)),
        }
    }
}

/// A materialized unit of context.
///
/// Records are immutable once written. A re-sync that sees a newer version of
/// the same `(source_kind, source_id)` writes a new record that supersedes the
/// old one rather than editing it in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextRecord {
    pub source_kind: SourceKind,
    pub source_id: String,
    pub title: String,
    pub body_text: String,
    pub author: String,
    #[serde(default)]
    pub author_address: Option<String>,
    pub visibility: Visibility,
    pub modified_at: DateTime<Utc>,
}

impl ContextRecord {
    /// Position of this record in its sub-source's sync order.
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.modified_at, &self.source_id)
    }
}
