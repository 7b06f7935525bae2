use std::time::Duration;

use super::{CitationLookup, SourceError};
use async_trait::async_trait;
use serde::Deserialize;

const BASE_URL: &str = "https://api.semanticscholar.org/graph/v1";
const FIELDS: &str = "citationCount,title,authors";
const CANDIDATES: &str = "5";

/// Citation counts from the Semantic Scholar graph API.
///
/// Matching is approximate: an exact (case-insensitive, trimmed) title match
/// wins, otherwise the top candidate's count is used even when it may belong
/// to a different paper.
pub struct SemanticScholarCitations {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl SemanticScholarCitations {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Result<Self, SourceError> {
        Self::with_base_url(BASE_URL, api_key, timeout)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            client: super::http_client(timeout)?,
            base_url: base_url.into(),
            api_key,
        })
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }

    async fn search_candidates(&self, title: &str) -> Result<Vec<S2Paper>, SourceError> {
        let url = format!("{}/paper/search", self.base_url);
        let resp = self
            .add_auth(self.client.get(&url).query(&[
                ("query", title),
                ("fields", FIELDS),
                ("limit", CANDIDATES),
            ]))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(SourceError::Api(format!(
                "Semantic Scholar returned {}",
                resp.status()
            )));
        }
        let body: S2SearchResponse = resp.json().await?;
        Ok(body.data.unwrap_or_default())
    }
}

#[derive(Deserialize)]
struct S2SearchResponse {
    data: Option<Vec<S2Paper>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Paper {
    title: Option<String>,
    citation_count: Option<u64>,
}

/// Exact title match first, then the top candidate, then 0.
fn pick_citation_count(title: &str, candidates: &[S2Paper]) -> u64 {
    let wanted = title.trim().to_lowercase();
    candidates
        .iter()
        .find(|p| {
            p.title
                .as_deref()
                .is_some_and(|t| t.trim().to_lowercase() == wanted)
        })
        .or_else(|| candidates.first())
        .and_then(|p| p.citation_count)
        .unwrap_or(0)
}

#[async_trait]
impl CitationLookup for SemanticScholarCitations {
    async fn lookup(&self, title: &str, _authors: &[String]) -> u64 {
        if title.trim().is_empty() {
            return 0;
        }
        match self.search_candidates(title).await {
            Ok(candidates) => pick_citation_count(title, &candidates),
            Err(e) => {
                tracing::warn!("Citation lookup failed for {:?}: {}", title, e);
                0
            }
        }
    }
}
