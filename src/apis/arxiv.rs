use std::sync::Arc;
use std::time::Duration;

use super::{Article, ArticleSource, CitationLookup, RawRecord, SourceError};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;

const BASE_URL: &str = "http://export.arxiv.org/api/query";

pub struct ArxivClient {
    client: reqwest::Client,
    base_url: String,
    citations: Arc<dyn CitationLookup>,
    citation_concurrency: usize,
}

impl ArxivClient {
    pub fn new(
        citations: Arc<dyn CitationLookup>,
        citation_concurrency: usize,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        Self::with_base_url(BASE_URL, citations, citation_concurrency, timeout)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        citations: Arc<dyn CitationLookup>,
        citation_concurrency: usize,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            client: super::http_client(timeout)?,
            base_url: base_url.into(),
            citations,
            citation_concurrency,
        })
    }
}

#[async_trait]
impl ArticleSource for ArxivClient {
    fn key(&self) -> &str {
        "arxiv"
    }

    fn label(&self) -> &str {
        "arXiv"
    }

    async fn fetch(&self, query: &str, limit: u32) -> Result<Vec<Article>, SourceError> {
        let search = format!("all:{}", query);
        let max = limit.to_string();
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("search_query", search.as_str()),
                ("start", "0"),
                ("max_results", max.as_str()),
                ("sortBy", "relevance"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let records = parse_atom_feed(&resp)?;
        tracing::debug!("arXiv returned {} entries for {:?}", records.len(), query);
        Ok(super::enrich(
            records,
            self.citations.as_ref(),
            self.citation_concurrency,
            self.key(),
            self.label(),
        )
        .await)
    }
}

#[derive(Default)]
struct EntryBuilder {
    id_url: String,
    title: String,
    summary: String,
    published: String,
    authors: Vec<String>,
    bad_text: Option<String>,
}

impl EntryBuilder {
    fn finish(self) -> Result<RawRecord, SourceError> {
        if let Some(err) = self.bad_text {
            return Err(SourceError::Parse(format!("XML text error: {}", err)));
        }
        let id_url = self.id_url.trim();
        let native_id = id_url
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SourceError::Parse("arXiv entry without id".into()))?;
        Ok(RawRecord {
            native_id: native_id.to_string(),
            title: super::squash_whitespace(&self.title),
            authors: self.authors,
            abstract_text: super::squash_whitespace(&self.summary),
            url: id_url.to_string(),
            published_date: self.published.trim().chars().take(10).collect(),
        })
    }
}

/// Parse an arXiv Atom feed. Entries that cannot be turned into a record
/// are logged and skipped; a feed that is not well-formed XML is an error.
fn parse_atom_feed(xml: &str) -> Result<Vec<RawRecord>, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut records = Vec::new();
    let mut entry: Option<EntryBuilder> = None;
    let mut path: Vec<String> = Vec::new();
    let mut author_name = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if tag == "entry" {
                    entry = Some(EntryBuilder::default());
                } else if tag == "author" {
                    author_name.clear();
                }
                path.push(tag);
            }
            Ok(Event::Text(e)) => {
                if let Some(current) = entry.as_mut() {
                    match e.unescape() {
                        Ok(text) => {
                            let parent = path.len().checked_sub(2).map(|i| path[i].as_str());
                            match (parent, path.last().map(String::as_str)) {
                                (Some("entry"), Some("id")) => current.id_url.push_str(&text),
                                (Some("entry"), Some("title")) => current.title.push_str(&text),
                                (Some("entry"), Some("summary")) => current.summary.push_str(&text),
                                (Some("entry"), Some("published")) => {
                                    current.published.push_str(&text)
                                }
                                (Some("author"), Some("name")) => author_name.push_str(&text),
                                _ => {}
                            }
                        }
                        Err(err) => {
                            current.bad_text.get_or_insert_with(|| err.to_string());
                        }
                    }
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                path.pop();
                if tag == "author" {
                    if let Some(current) = entry.as_mut() {
                        let name = author_name.trim();
                        if !name.is_empty() {
                            current.authors.push(name.to_string());
                        }
                    }
                } else if tag == "entry" {
                    if let Some(done) = entry.take() {
                        match done.finish() {
                            Ok(record) => records.push(record),
                            Err(e) => tracing::warn!("Skipping arXiv entry: {}", e),
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Parse(format!("XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(records)
}
