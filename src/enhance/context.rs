//! Context research: keyword ranking over the synced corpus.
//!
//! Ranking is deterministic. The same corpus and prompt always produce the
//! same hits in the same order.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use anyhow::Result;
use enhancer_common::ContextRecord;

use crate::store::DbHandle;

/// Body occurrences of a single keyword stop counting past this.
const BODY_HITS_CAP: usize = 5;
const TITLE_WEIGHT: usize = 3;
const MIN_KEYWORD_LEN: usize = 3;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "this", "that", "from", "into", "when", "then", "should",
    "would", "could", "have", "has", "are", "was", "were", "not", "but", "all", "any", "can",
    "our", "out", "use", "using", "add", "fix", "issue", "need", "needs", "make", "also", "what",
    "which", "there", "their", "about", "after", "before", "some", "more", "only", "does", "just",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ContextHit {
    pub record: ContextRecord,
    pub score: usize,
}

/// Lowercased, deduplicated keywords in first-seen order.
pub fn keywords(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    text.split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        .map(|t| t.trim_matches('-').to_lowercase())
        .filter(|t| t.chars().count() >= MIN_KEYWORD_LEN)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}

fn score(record: &ContextRecord, keywords: &[String]) -> usize {
    let title = record.title.to_lowercase();
    let body = record.body_text.to_lowercase();
    keywords
        .iter()
        .map(|k| {
            count_occurrences(&title, k) * TITLE_WEIGHT
                + count_occurrences(&body, k).min(BODY_HITS_CAP)
        })
        .sum()
}

fn order(a: &ContextHit, b: &ContextHit) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| b.record.modified_at.cmp(&a.record.modified_at))
        .then_with(|| a.record.source_kind.as_str().cmp(b.record.source_kind.as_str()))
        .then_with(|| a.record.source_id.cmp(&b.record.source_id))
}

/// Rank `records` against `prompt`, keeping at most `limit` hits with a
/// non-zero score. Ties go to the newer record.
pub fn rank(records: Vec<ContextRecord>, prompt: &str, limit: usize) -> Vec<ContextHit> {
    let keywords = keywords(prompt);
    if keywords.is_empty() {
        return Vec::new();
    }
    let mut hits: Vec<ContextHit> = records
        .into_iter()
        .filter_map(|record| {
            let score = score(&record, &keywords);
            (score > 0).then_some(ContextHit { record, score })
        })
        .collect();
    hits.sort_by(order);
    hits.truncate(limit);
    hits
}

/// Rank the current version of every record in the corpus.
pub async fn research(corpus: &DbHandle, prompt: &str, limit: usize) -> Result<Vec<ContextHit>> {
    let records = corpus.call(|db| db.latest_records()).await?;
    let hits = rank(records, prompt, limit);
    tracing::debug!(hits = hits.len(), "Context research complete");
    Ok(hits)
}

/// Render hits as a prompt section.
pub fn render(hits: &[ContextHit]) -> String {
    if hits.is_empty() {
        return "No related discussions or documents were found.".to_string();
    }
    let mut out = String::new();
    for hit in hits {
        let record = &hit.record;
        out.push_str(&format!(
            "### {} ({}, {}, {} by {})\n{}\n\n",
            record.title,
            record.source_kind.as_str(),
            record.visibility.as_str(),
            record.modified_at.format("%Y-%m-%d"),
            record.author,
            record.body_text.trim()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use enhancer_common::{SourceKind, Visibility};

    fn record(id: &str, title: &str, body: &str, day: u32) -> ContextRecord {
        ContextRecord {
            source_kind: SourceKind::Chat,
            source_id: id.to_string(),
            title: title.to_string(),
            body_text: body.to_string(),
            author: "dana".to_string(),
            author_address: None,
            visibility: Visibility::Internal,
            modified_at: Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn keywords_drop_stopwords_short_tokens_and_duplicates() {
        assert_eq!(
            keywords("Fix the OAuth login for SSO users, oauth again 2024"),
            vec!["oauth", "login", "sso", "users", "again"]
        );
    }

    #[test]
    fn title_matches_outweigh_body_matches() {
        let hits = rank(
            vec![
                record("a", "#general", "billing billing", 1),
                record("b", "Billing export", "numbers", 1),
            ],
            "billing export broken",
            10,
        );
        assert_eq!(hits[0].record.source_id, "b");
        assert_eq!(hits[0].score, 6);
        assert_eq!(hits[1].score, 2);
    }

    #[test]
    fn body_frequency_is_capped() {
        let spam = "retry ".repeat(50);
        let hits = rank(vec![record("a", "x", &spam, 1)], "retry", 10);
        assert_eq!(hits[0].score, BODY_HITS_CAP);
    }

    #[test]
    fn ties_prefer_newer_records_then_id() {
        let hits = rank(
            vec![
                record("old", "webhooks", "", 1),
                record("z-new", "webhooks", "", 9),
                record("a-new", "webhooks", "", 9),
            ],
            "webhooks",
            10,
        );
        let ids: Vec<_> = hits.iter().map(|h| h.record.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a-new", "z-new", "old"]);
    }

    #[test]
    fn unrelated_records_and_empty_prompts_yield_nothing() {
        let records = vec![record("a", "lunch", "tacos", 1)];
        assert!(rank(records.clone(), "database migration", 10).is_empty());
        assert!(rank(records, "the and", 10).is_empty());
    }

    #[test]
    fn limit_truncates() {
        let records = (1..=5)
            .map(|d| record(&format!("r{}", d), "deploy", "", d))
            .collect();
        assert_eq!(rank(records, "deploy", 2).len(), 2);
    }

    #[test]
    fn render_mentions_source_and_visibility() {
        let hits = rank(vec![record("a", "deploy", "rollback plan", 1)], "deploy", 1);
        let text = render(&hits);
        assert!(text.contains("### deploy (chat, internal"));
        assert!(text.contains("rollback plan"));
    }
}
