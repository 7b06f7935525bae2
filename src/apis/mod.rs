pub mod arxiv;
pub mod pubmed;
pub mod semantic_scholar;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;

const USER_AGENT: &str = "lit-search/0.1";

/// Canonical record every source maps its raw results into.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub url: String,
    pub source: String,
    pub published_date: String,
    pub citations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ranking: Option<f64>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("API error: {0}")]
    Api(String),
}

/// One upstream literature source.
///
/// `fetch` reports a failure of the whole request as `Err`; a malformed
/// individual item is skipped inside the adapter and never fails the batch.
#[async_trait]
pub trait ArticleSource: Send + Sync {
    /// Lowercase selector matched against the request's `sources`.
    fn key(&self) -> &str;
    /// Display label written into `Article::source`.
    fn label(&self) -> &str;
    async fn fetch(&self, query: &str, limit: u32) -> Result<Vec<Article>, SourceError>;
}

/// Best-effort citation count lookup. All failures collapse to 0.
#[async_trait]
pub trait CitationLookup: Send + Sync {
    async fn lookup(&self, title: &str, authors: &[String]) -> u64;
}

/// Enrichment switched off: every record gets 0 citations.
pub struct NoCitations;

#[async_trait]
impl CitationLookup for NoCitations {
    async fn lookup(&self, _title: &str, _authors: &[String]) -> u64 {
        0
    }
}

/// A parsed upstream item before citation enrichment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    pub native_id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub abstract_text: String,
    pub url: String,
    pub published_date: String,
}

impl RawRecord {
    pub fn into_article(self, key: &str, label: &str, citations: u64) -> Article {
        Article {
            id: format!("{}_{}", key, self.native_id),
            title: self.title,
            authors: self.authors,
            abstract_text: self.abstract_text,
            url: self.url,
            source: label.to_string(),
            published_date: normalize_date(&self.published_date),
            citations,
            ranking: None,
        }
    }
}

/// Look up citations for every record, at most `concurrency` in flight,
/// keeping the upstream order.
pub async fn enrich(
    records: Vec<RawRecord>,
    citations: &dyn CitationLookup,
    concurrency: usize,
    key: &str,
    label: &str,
) -> Vec<Article> {
    stream::iter(records)
        .map(|record| async move {
            let count = citations.lookup(&record.title, &record.authors).await;
            record.into_article(key, label, count)
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, SourceError> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}

/// Reduce a date string to its longest valid `YYYY[-MM[-DD]]` prefix,
/// or empty when not even the year is usable.
pub fn normalize_date(raw: &str) -> String {
    let raw = raw.trim();
    let bytes = raw.as_bytes();
    let digits = |range: std::ops::Range<usize>| {
        bytes.get(range).is_some_and(|b| b.iter().all(u8::is_ascii_digit))
    };
    let in_range = |range: std::ops::Range<usize>, max: u32| {
        raw[range].parse::<u32>().is_ok_and(|v| (1..=max).contains(&v))
    };

    if !digits(0..4) {
        return String::new();
    }
    if bytes.get(4) != Some(&b'-') || !digits(5..7) || !in_range(5..7, 12) {
        return raw[..4].to_string();
    }
    if bytes.get(7) != Some(&b'-') || !digits(8..10) || !in_range(8..10, 31) {
        return raw[..7].to_string();
    }
    raw[..10].to_string()
}

/// Collapse runs of whitespace (including newlines) into single spaces.
pub(crate) fn squash_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
