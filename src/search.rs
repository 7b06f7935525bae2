use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use futures::FutureExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;

use crate::apis::{Article, ArticleSource, SourceError};
use crate::filter::filter_by_year;
use crate::ranking::rank_all;
use crate::sort::{sort_articles, SortBy, SortOrder};

const WILDCARD: &str = "all";

fn default_max_results() -> u32 {
    10
}

fn default_sort_by() -> String {
    "relevance".into()
}

fn default_sort_order() -> String {
    "desc".into()
}

/// An aggregation request.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    #[schemars(description = "Search query string")]
    pub query: String,
    #[schemars(description = "Sources to search, case-insensitive (e.g. [\"pubmed\", \"arxiv\"] or [\"all\"])")]
    pub sources: Vec<String>,
    #[schemars(description = "Maximum articles to return (default 10)")]
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[schemars(description = "Earliest publication year, inclusive (e.g. \"2020\")")]
    #[serde(default)]
    pub start_year: Option<String>,
    #[schemars(description = "Latest publication year, inclusive (e.g. \"2024\")")]
    #[serde(default)]
    pub end_year: Option<String>,
    #[schemars(description = "Sort key: 'relevance' (default), 'citations', or 'date'")]
    #[serde(default = "default_sort_by")]
    pub sort_by: String,
    #[schemars(description = "Sort direction: 'desc' (default) or 'asc'. Ignored for relevance")]
    #[serde(default = "default_sort_order")]
    pub sort_order: String,
}

#[cfg(test)]
impl QuerySpec {
    pub fn new(query: impl Into<String>, sources: &[&str]) -> Self {
        Self {
            query: query.into(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            max_results: default_max_results(),
            start_year: None,
            end_year: None,
            sort_by: default_sort_by(),
            sort_order: default_sort_order(),
        }
    }
}

/// Why one source contributed nothing to a response.
#[derive(Debug, Error)]
pub enum SourceFailure {
    #[error("{0}")]
    Upstream(#[from] SourceError),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("panicked: {0}")]
    Panicked(String),
}

#[derive(Debug)]
pub struct SourceOutcome {
    pub source: String,
    pub result: Result<Vec<Article>, SourceFailure>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub articles: Vec<Article>,
    pub total: usize,
    /// Sources that failed during this request. Never serialized.
    #[serde(skip)]
    pub failures: Vec<(String, SourceFailure)>,
}

impl SearchResponse {
    fn empty() -> Self {
        Self {
            articles: Vec::new(),
            total: 0,
            failures: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("internal error: {0}")]
    Internal(String),
}

/// Fans a query out to the registered sources and merges, ranks, filters,
/// sorts, and pages the results.
#[derive(Clone)]
pub struct Aggregator {
    sources: Arc<Vec<Arc<dyn ArticleSource>>>,
    source_timeout: Duration,
}

impl Aggregator {
    pub fn new(sources: Vec<Arc<dyn ArticleSource>>, source_timeout: Duration) -> Self {
        Self {
            sources: Arc::new(sources),
            source_timeout,
        }
    }

    pub fn source_keys(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.key().to_string()).collect()
    }

    pub async fn aggregate(&self, spec: &QuerySpec) -> Result<SearchResponse, AggregateError> {
        self.aggregate_at(spec, Utc::now().date_naive()).await
    }

    /// Same as [`aggregate`](Self::aggregate) with recency measured from `today`.
    pub async fn aggregate_at(
        &self,
        spec: &QuerySpec,
        today: NaiveDate,
    ) -> Result<SearchResponse, AggregateError> {
        let selected = self.select(&spec.sources);
        if selected.is_empty() {
            tracing::info!("No known source selected by {:?}", spec.sources);
            return Ok(SearchResponse::empty());
        }

        let limit = spec.max_results.saturating_mul(2);
        let outcomes = self.fan_out(selected, &spec.query, limit).await?;

        let mut seen = HashSet::new();
        let mut articles = Vec::new();
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(batch) => {
                    tracing::debug!("{} returned {} articles", outcome.source, batch.len());
                    for article in batch {
                        if seen.insert(article.id.clone()) {
                            articles.push(article);
                        } else {
                            tracing::debug!("Dropping duplicate article {}", article.id);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Source {} failed: {}", outcome.source, e);
                    failures.push((outcome.source, e));
                }
            }
        }

        rank_all(&mut articles, today);
        let mut articles = filter_by_year(
            articles,
            spec.start_year.as_deref(),
            spec.end_year.as_deref(),
        );
        sort_articles(
            &mut articles,
            SortBy::parse(&spec.sort_by),
            SortOrder::parse(&spec.sort_order),
        );

        let total = articles.len();
        articles.truncate(spec.max_results as usize);
        tracing::info!(
            "Query {:?}: {} of {} articles returned, {} source(s) failed",
            spec.query,
            articles.len(),
            total,
            failures.len()
        );

        Ok(SearchResponse {
            articles,
            total,
            failures,
        })
    }

    fn select(&self, requested: &[String]) -> Vec<Arc<dyn ArticleSource>> {
        let requested: HashSet<String> = requested.iter().map(|s| s.trim().to_lowercase()).collect();
        let everything = requested.contains(WILDCARD);
        self.sources
            .iter()
            .filter(|s| everything || requested.contains(&s.key().to_lowercase()))
            .cloned()
            .collect()
    }

    /// Run every selected source as its own task. Outcomes come back in
    /// selection order; dropping the returned future aborts pending tasks.
    async fn fan_out(
        &self,
        selected: Vec<Arc<dyn ArticleSource>>,
        query: &str,
        limit: u32,
    ) -> Result<Vec<SourceOutcome>, AggregateError> {
        let timeout = self.source_timeout;
        let names: Vec<String> = selected.iter().map(|s| s.label().to_string()).collect();
        let mut tasks = JoinSet::new();
        for (slot, source) in selected.into_iter().enumerate() {
            let query = query.to_string();
            tasks.spawn(async move {
                let fetch = AssertUnwindSafe(source.fetch(&query, limit)).catch_unwind();
                let result = match tokio::time::timeout(timeout, fetch).await {
                    Ok(Ok(Ok(articles))) => Ok(articles),
                    Ok(Ok(Err(e))) => Err(SourceFailure::Upstream(e)),
                    Ok(Err(payload)) => Err(SourceFailure::Panicked(panic_message(payload))),
                    Err(_) => Err(SourceFailure::TimedOut(timeout)),
                };
                (slot, result)
            });
        }

        let mut slots: Vec<Option<Result<Vec<Article>, SourceFailure>>> =
            names.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (slot, result) = joined
                .map_err(|e| AggregateError::Internal(format!("source task failed: {}", e)))?;
            slots[slot] = Some(result);
        }

        names
            .into_iter()
            .zip(slots)
            .map(|(source, slot)| {
                let result = slot.ok_or_else(|| {
                    AggregateError::Internal(format!("no outcome recorded for {}", source))
                })?;
                Ok(SourceOutcome { source, result })
            })
            .collect()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Notify;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
    }

    fn article(source: &str, id: &str, citations: u64, date: &str) -> Article {
        Article {
            id: format!("{}_{}", source, id),
            title: format!("Paper {}", id),
            authors: vec!["A. Author".into()],
            abstract_text: String::new(),
            url: format!("https://example.org/{}", id),
            source: source.into(),
            published_date: date.into(),
            citations,
            ranking: None,
        }
    }

    enum Behavior {
        Return(Vec<Article>),
        Fail,
        Panic,
        Hang,
    }

    struct FakeSource {
        key: &'static str,
        behavior: Behavior,
        last_limit: AtomicU32,
    }

    impl FakeSource {
        fn new(key: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                key,
                behavior,
                last_limit: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ArticleSource for FakeSource {
        fn key(&self) -> &str {
            self.key
        }

        fn label(&self) -> &str {
            self.key
        }

        async fn fetch(&self, _query: &str, limit: u32) -> Result<Vec<Article>, SourceError> {
            self.last_limit.store(limit, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Return(articles) => Ok(articles.clone()),
                Behavior::Fail => Err(SourceError::Api("upstream down".into())),
                Behavior::Panic => panic!("adapter bug"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Vec::new())
                }
            }
        }
    }

    fn aggregator(sources: Vec<Arc<FakeSource>>) -> Aggregator {
        let sources = sources
            .into_iter()
            .map(|s| s as Arc<dyn ArticleSource>)
            .collect();
        Aggregator::new(sources, Duration::from_millis(200))
    }

    fn ids(response: &SearchResponse) -> Vec<&str> {
        response.articles.iter().map(|a| a.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_single_source_page_ordered_by_relevance() {
        let pubmed = FakeSource::new(
            "pubmed",
            Behavior::Return(vec![
                article("pubmed", "1", 1, "2024-06-01"),
                article("pubmed", "2", 100, "2024-05-01"),
            ]),
        );
        let agg = aggregator(vec![pubmed.clone()]);
        let mut spec = QuerySpec::new("cancer", &["pubmed"]);
        spec.max_results = 2;

        let resp = agg.aggregate_at(&spec, today()).await.unwrap();
        assert_eq!(resp.total, 2);
        assert_eq!(ids(&resp), ["pubmed_2", "pubmed_1"]);
        let rankings: Vec<f64> = resp.articles.iter().map(|a| a.ranking.unwrap()).collect();
        assert!(rankings[0] >= rankings[1]);
        assert_eq!(pubmed.last_limit.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_unknown_source_is_empty_not_error() {
        let agg = aggregator(vec![FakeSource::new(
            "pubmed",
            Behavior::Return(vec![article("pubmed", "1", 1, "2020")]),
        )]);
        let resp = agg
            .aggregate_at(&QuerySpec::new("x", &["nonexistent"]), today())
            .await
            .unwrap();
        assert!(resp.articles.is_empty());
        assert_eq!(resp.total, 0);
        assert!(resp.failures.is_empty());
    }

    #[tokio::test]
    async fn test_selectors_are_case_insensitive_and_wildcard() {
        let agg = aggregator(vec![
            FakeSource::new("pubmed", Behavior::Return(vec![article("pubmed", "1", 0, "")])),
            FakeSource::new("arxiv", Behavior::Return(vec![article("arxiv", "1", 0, "")])),
        ]);
        let resp = agg
            .aggregate_at(&QuerySpec::new("x", &["ArXiv"]), today())
            .await
            .unwrap();
        assert_eq!(ids(&resp), ["arxiv_1"]);

        let resp = agg
            .aggregate_at(&QuerySpec::new("x", &["ALL"]), today())
            .await
            .unwrap();
        assert_eq!(resp.total, 2);
    }

    #[tokio::test]
    async fn test_failing_sources_degrade_gracefully() {
        let agg = aggregator(vec![
            FakeSource::new("pubmed", Behavior::Fail),
            FakeSource::new("broken", Behavior::Panic),
            FakeSource::new("slow", Behavior::Hang),
            FakeSource::new("arxiv", Behavior::Return(vec![article("arxiv", "9", 3, "2023")])),
        ]);
        let resp = agg
            .aggregate_at(&QuerySpec::new("x", &["all"]), today())
            .await
            .unwrap();

        assert_eq!(ids(&resp), ["arxiv_9"]);
        assert_eq!(resp.total, 1);
        let failed: Vec<&str> = resp.failures.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(failed, ["pubmed", "broken", "slow"]);
        assert!(matches!(resp.failures[0].1, SourceFailure::Upstream(_)));
        assert!(matches!(&resp.failures[1].1, SourceFailure::Panicked(msg) if msg == "adapter bug"));
        assert!(matches!(resp.failures[2].1, SourceFailure::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_total_ignores_page_size() {
        let batch: Vec<Article> = (0..7)
            .map(|i| article("pubmed", &i.to_string(), i, "2022-01-01"))
            .collect();
        let agg = aggregator(vec![FakeSource::new("pubmed", Behavior::Return(batch))]);

        for page in [1, 3, 10] {
            let mut spec = QuerySpec::new("x", &["pubmed"]);
            spec.max_results = page;
            let resp = agg.aggregate_at(&spec, today()).await.unwrap();
            assert_eq!(resp.total, 7);
            assert_eq!(resp.articles.len(), (page as usize).min(7));
        }
    }

    #[tokio::test]
    async fn test_filter_then_sort_then_page() {
        let agg = aggregator(vec![FakeSource::new(
            "pubmed",
            Behavior::Return(vec![
                article("pubmed", "a", 5, "2019-01-01"),
                article("pubmed", "b", 5, "2020-03-01"),
                article("pubmed", "c", 1, "2021-07"),
                article("pubmed", "d", 3, "2021"),
                article("pubmed", "e", 50, ""),
                article("pubmed", "f", 9, "2022-02-02"),
            ]),
        )]);
        let mut spec = QuerySpec::new("x", &["pubmed"]);
        spec.start_year = Some("2020".into());
        spec.end_year = Some("2021".into());
        spec.sort_by = "citations".into();
        spec.sort_order = "asc".into();
        spec.max_results = 2;

        let resp = agg.aggregate_at(&spec, today()).await.unwrap();
        assert_eq!(resp.total, 3);
        assert_eq!(ids(&resp), ["pubmed_c", "pubmed_d"]);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_dropped() {
        let agg = aggregator(vec![FakeSource::new(
            "arxiv",
            Behavior::Return(vec![
                article("arxiv", "1", 10, "2020"),
                article("arxiv", "1", 10, "2020"),
            ]),
        )]);
        let resp = agg
            .aggregate_at(&QuerySpec::new("x", &["arxiv"]), today())
            .await
            .unwrap();
        assert_eq!(resp.total, 1);
    }

    #[tokio::test]
    async fn test_merge_order_breaks_ties_by_registration() {
        let agg = aggregator(vec![
            FakeSource::new("pubmed", Behavior::Return(vec![article("pubmed", "1", 0, "")])),
            FakeSource::new("arxiv", Behavior::Return(vec![article("arxiv", "1", 0, "")])),
        ]);
        let resp = agg
            .aggregate_at(&QuerySpec::new("x", &["arxiv", "pubmed"]), today())
            .await
            .unwrap();
        assert_eq!(ids(&resp), ["pubmed_1", "arxiv_1"]);
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Signals once its fetch is in flight, then never finishes.
    struct StalledSource {
        started: Arc<Notify>,
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ArticleSource for StalledSource {
        fn key(&self) -> &str {
            "stalled"
        }

        fn label(&self) -> &str {
            "stalled"
        }

        async fn fetch(&self, _query: &str, _limit: u32) -> Result<Vec<Article>, SourceError> {
            let _guard = SetOnDrop(Arc::clone(&self.dropped));
            self.started.notify_one();
            std::future::pending::<()>().await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_dropping_aggregate_aborts_source_tasks() {
        let started = Arc::new(Notify::new());
        let dropped = Arc::new(AtomicBool::new(false));
        let source: Arc<dyn ArticleSource> = Arc::new(StalledSource {
            started: Arc::clone(&started),
            dropped: Arc::clone(&dropped),
        });
        let agg = Aggregator::new(vec![source], Duration::from_secs(30));
        let spec = QuerySpec::new("x", &["stalled"]);

        {
            let pending = agg.aggregate_at(&spec, today());
            tokio::pin!(pending);
            tokio::select! {
                _ = &mut pending => panic!("stalled source completed"),
                _ = started.notified() => {}
            }
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("source task still running after aggregate was dropped");
    }

    #[test]
    fn test_query_spec_defaults_from_json() {
        let spec: QuerySpec =
            serde_json::from_str(r#"{"query": "cancer", "sources": ["pubmed"]}"#).unwrap();
        assert_eq!(spec.max_results, 10);
        assert_eq!(spec.sort_by, "relevance");
        assert_eq!(spec.sort_order, "desc");
        assert!(spec.start_year.is_none());

        let spec: QuerySpec = serde_json::from_str(
            r#"{"query": "q", "sources": [], "maxResults": 3, "startYear": "2020", "sortOrder": "asc"}"#,
        )
        .unwrap();
        assert_eq!(spec.max_results, 3);
        assert_eq!(spec.start_year.as_deref(), Some("2020"));
        assert_eq!(spec.sort_order, "asc");
    }

    #[test]
    fn test_response_serializes_articles_and_total_only() {
        let resp = SearchResponse {
            articles: vec![],
            total: 0,
            failures: vec![("pubmed".into(), SourceFailure::TimedOut(Duration::from_secs(1)))],
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json, serde_json::json!({"articles": [], "total": 0}));
    }
}
