use std::sync::Arc;
use std::time::Duration;

use crate::apis::{self, ArticleSource, CitationLookup, SourceError};
use crate::search::Aggregator;

const KNOWN_SOURCES: [&str; 2] = ["pubmed", "arxiv"];

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub ncbi_api_key: Option<String>,
    pub semantic_scholar_api_key: Option<String>,
    pub citations_enabled: bool,
    pub citation_concurrency: usize,
    pub request_timeout: Duration,
    pub source_timeout: Duration,
    pub enabled_source_names: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ncbi_api_key: None,
            semantic_scholar_api_key: None,
            citations_enabled: true,
            citation_concurrency: 4,
            request_timeout: Duration::from_secs(15),
            source_timeout: Duration::from_secs(60),
            enabled_source_names: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let citations_enabled = non_empty("LIT_SEARCH_CITATIONS")
            .map(|v| !matches!(v.trim().to_lowercase().as_str(), "off" | "false" | "0" | "no"))
            .unwrap_or(defaults.citations_enabled);

        let enabled_source_names = non_empty("LIT_SEARCH_SOURCES")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            ncbi_api_key: non_empty("NCBI_API_KEY"),
            semantic_scholar_api_key: non_empty("SEMANTIC_SCHOLAR_API_KEY"),
            citations_enabled,
            citation_concurrency: parse_or(
                non_empty("LIT_SEARCH_CITATION_CONCURRENCY"),
                "LIT_SEARCH_CITATION_CONCURRENCY",
                defaults.citation_concurrency,
            )
            .max(1),
            request_timeout: Duration::from_secs(parse_or(
                non_empty("LIT_SEARCH_REQUEST_TIMEOUT_SECS"),
                "LIT_SEARCH_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )),
            source_timeout: Duration::from_secs(parse_or(
                non_empty("LIT_SEARCH_SOURCE_TIMEOUT_SECS"),
                "LIT_SEARCH_SOURCE_TIMEOUT_SECS",
                defaults.source_timeout.as_secs(),
            )),
            enabled_source_names,
        }
    }

    fn should_enable(&self, name: &str) -> bool {
        self.enabled_source_names.is_empty()
            || self.enabled_source_names.iter().any(|n| n == name)
    }

    /// Build the citation enricher shared by every source.
    pub fn build_citations(&self) -> Result<Arc<dyn CitationLookup>, SourceError> {
        if !self.citations_enabled {
            tracing::info!("Citation enrichment disabled");
            return Ok(Arc::new(apis::NoCitations));
        }
        Ok(Arc::new(apis::semantic_scholar::SemanticScholarCitations::new(
            self.semantic_scholar_api_key.clone(),
            self.request_timeout,
        )?))
    }

    /// Build the list of enabled article sources.
    pub fn build_sources(
        &self,
        citations: Arc<dyn CitationLookup>,
    ) -> Result<Vec<Arc<dyn ArticleSource>>, SourceError> {
        let mut sources: Vec<Arc<dyn ArticleSource>> = Vec::new();

        if self.should_enable("pubmed") {
            sources.push(Arc::new(apis::pubmed::PubMedClient::new(
                self.ncbi_api_key.clone(),
                Arc::clone(&citations),
                self.citation_concurrency,
                self.request_timeout,
            )?));
        }
        if self.should_enable("arxiv") {
            sources.push(Arc::new(apis::arxiv::ArxivClient::new(
                Arc::clone(&citations),
                self.citation_concurrency,
                self.request_timeout,
            )?));
        }

        for name in &self.enabled_source_names {
            if !KNOWN_SOURCES.contains(&name.as_str()) {
                tracing::warn!("Ignoring unknown source in LIT_SEARCH_SOURCES: {}", name);
            }
        }
        Ok(sources)
    }

    pub fn build_aggregator(&self) -> Result<Aggregator, SourceError> {
        let citations = self.build_citations()?;
        let sources = self.build_sources(citations)?;
        Ok(Aggregator::new(sources, self.source_timeout))
    }

    /// Return a list of source status descriptions.
    pub fn source_status(&self) -> Vec<SourceStatus> {
        let citation_note = match (self.citations_enabled, &self.semantic_scholar_api_key) {
            (false, _) => "citations disabled",
            (true, Some(_)) => "citations via Semantic Scholar (API key set)",
            (true, None) => "citations via Semantic Scholar (no API key, rate limited)",
        };

        KNOWN_SOURCES
            .iter()
            .map(|name| {
                let enabled = self.should_enable(name);
                let note = if !enabled {
                    "Disabled by LIT_SEARCH_SOURCES filter".to_string()
                } else if *name == "pubmed" && self.ncbi_api_key.is_some() {
                    format!("NCBI API key set; {}", citation_note)
                } else {
                    citation_note.to_string()
                };
                SourceStatus {
                    name: name.to_string(),
                    enabled,
                    note,
                }
            })
            .collect()
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, key: &str, default: T) -> T {
    match raw {
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid value {:?} for {}, using default", v, key);
            default
        }),
        None => default,
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub enabled: bool,
    pub note: String,
}
