//! Email sender allow-list.
//!
//! The effective list is derived data: rebuilt at the start of every email
//! sync from configuration plus the chat corpus, never stored on its own.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::store::DbHandle;

/// Why an entry is on the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AllowReason {
    Explicit,
    InternalDomain,
    DerivedFromChat,
}

impl AllowReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::InternalDomain => "internal-domain",
            Self::DerivedFromChat => "derived-from-chat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowTarget {
    Address(String),
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowListEntry {
    pub target: AllowTarget,
    pub reason: AllowReason,
}

/// Source of addresses observed in chat.
#[async_trait]
pub trait AddressBook: Send + Sync {
    async fn chat_addresses(&self) -> Result<Vec<String>>;
}

#[async_trait]
impl AddressBook for DbHandle {
    async fn chat_addresses(&self) -> Result<Vec<String>> {
        self.call(|db| db.chat_author_addresses()).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct AllowList {
    addresses: BTreeMap<String, AllowReason>,
    domains: BTreeMap<String, AllowReason>,
}

impl AllowList {
    /// Build the list. `explicit` entries are either full addresses or
    /// `@domain`. When the same target arrives from several places the
    /// strongest reason (explicit first) is kept.
    pub fn build(explicit: &[String], internal_domains: &[String], chat_addresses: &[String]) -> Self {
        let mut list = Self::default();
        for raw in explicit {
            let item = raw.trim().to_lowercase();
            if item.is_empty() {
                continue;
            }
            match item.strip_prefix('@') {
                Some(domain) if !domain.is_empty() => {
                    list.add_domain(domain, AllowReason::Explicit)
                }
                Some(_) => {}
                None => list.add_address(&item, AllowReason::Explicit),
            }
        }
        for domain in internal_domains {
            list.add_domain(&domain.trim().to_lowercase(), AllowReason::InternalDomain);
        }
        for address in chat_addresses {
            list.add_address(&address.trim().to_lowercase(), AllowReason::DerivedFromChat);
        }
        list
    }

    fn add_address(&mut self, address: &str, reason: AllowReason) {
        if address.contains('@') {
            let slot = self.addresses.entry(address.to_string()).or_insert(reason);
            *slot = (*slot).min(reason);
        }
    }

    fn add_domain(&mut self, domain: &str, reason: AllowReason) {
        if !domain.is_empty() {
            let slot = self.domains.entry(domain.to_string()).or_insert(reason);
            *slot = (*slot).min(reason);
        }
    }

    /// Why `sender` is allowed, or `None` if it is not.
    pub fn permits(&self, sender: &str) -> Option<AllowReason> {
        let sender = sender.trim().to_lowercase();
        if let Some(reason) = self.addresses.get(&sender) {
            return Some(*reason);
        }
        let (_, domain) = sender.rsplit_once('@')?;
        self.domains.get(domain).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.domains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addresses.len() + self.domains.len()
    }

    pub fn entries(&self) -> Vec<AllowListEntry> {
        let addresses = self.addresses.iter().map(|(a, r)| AllowListEntry {
            target: AllowTarget::Address(a.clone()),
            reason: *r,
        });
        let domains = self.domains.iter().map(|(d, r)| AllowListEntry {
            target: AllowTarget::Domain(d.clone()),
            reason: *r,
        });
        addresses.chain(domains).collect()
    }
}
