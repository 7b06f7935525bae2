use std::sync::Arc;
use std::time::Duration;

use super::{Article, ArticleSource, CitationLookup, RawRecord, SourceError};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;

const BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// PubMed via NCBI E-utilities: `esearch` for ids, then `efetch` for records.
pub struct PubMedClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    citations: Arc<dyn CitationLookup>,
    citation_concurrency: usize,
}

impl PubMedClient {
    pub fn new(
        api_key: Option<String>,
        citations: Arc<dyn CitationLookup>,
        citation_concurrency: usize,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        Self::with_base_url(BASE_URL, api_key, citations, citation_concurrency, timeout)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: Option<String>,
        citations: Arc<dyn CitationLookup>,
        citation_concurrency: usize,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            client: super::http_client(timeout)?,
            base_url: base_url.into(),
            api_key,
            citations,
            citation_concurrency,
        })
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.query(&[("api_key", key)]),
            None => req,
        }
    }

    async fn search_ids(&self, query: &str, limit: u32) -> Result<Vec<String>, SourceError> {
        let retmax = limit.to_string();
        let resp: ESearchResponse = self
            .add_auth(self.client.get(format!("{}/esearch.fcgi", self.base_url)).query(&[
                ("db", "pubmed"),
                ("term", query),
                ("retmax", retmax.as_str()),
                ("retmode", "json"),
            ]))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let result = resp.esearchresult;
        match result.error {
            Some(err) if result.idlist.is_empty() => Err(SourceError::Api(err)),
            _ => Ok(result.idlist),
        }
    }

    async fn fetch_records(&self, ids: &[String]) -> Result<String, SourceError> {
        let joined = ids.join(",");
        Ok(self
            .add_auth(self.client.get(format!("{}/efetch.fcgi", self.base_url)).query(&[
                ("db", "pubmed"),
                ("id", joined.as_str()),
                ("retmode", "xml"),
                ("rettype", "abstract"),
            ]))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?)
    }
}

#[derive(Deserialize)]
struct ESearchResponse {
    esearchresult: ESearchResult,
}

#[derive(Deserialize)]
struct ESearchResult {
    #[serde(default)]
    idlist: Vec<String>,
    #[serde(rename = "ERROR")]
    error: Option<String>,
}

#[async_trait]
impl ArticleSource for PubMedClient {
    fn key(&self) -> &str {
        "pubmed"
    }

    fn label(&self) -> &str {
        "PubMed"
    }

    async fn fetch(&self, query: &str, limit: u32) -> Result<Vec<Article>, SourceError> {
        let ids = self.search_ids(query, limit).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let xml = self.fetch_records(&ids).await?;
        let records = parse_pubmed_xml(&xml)?;
        tracing::debug!(
            "PubMed returned {} of {} requested records for {:?}",
            records.len(),
            ids.len(),
            query
        );
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
struct PubDate {
    year: String,
    month: String,
    day: String,
    medline: String,
}

impl PubDate {
    /// `YYYY[-MM[-DD]]`; a day is only kept when the month is known.
    fn compose(&self) -> String {
        let year = self.year.trim();
        let year = if year.is_empty() {
            self.medline.trim().get(..4).unwrap_or("")
        } else {
            year
        };
        if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
            return String::new();
        }
        let Some(month) = month_number(&self.month) else {
            return year.to_string();
        };
        match self.day.trim().parse::<u32>() {
            Ok(day) if (1..=31).contains(&day) => format!("{}-{:02}-{:02}", year, month, day),
            _ => format!("{}-{:02}", year, month),
        }
    }
}

fn month_number(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<u32>() {
        return (1..=12).contains(&n).then_some(n);
    }
    let prefix = raw.get(..3)?.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == prefix)
        .map(|i| i as u32 + 1)
}

#[derive(Default)]
struct RecordBuilder {
    pmid: String,
    pmid_closed: bool,
    title: String,
    authors: Vec<String>,
    author: Option<(String, String)>,
    abstract_parts: Vec<String>,
    pub_date: PubDate,
    pub_date_closed: bool,
    bad_text: Option<String>,
}

impl RecordBuilder {
    fn finish(self) -> Result<RawRecord, SourceError> {
        if let Some(err) = self.bad_text {
            return Err(SourceError::Parse(format!("XML text error: {}", err)));
        }
        let pmid = self.pmid.trim().to_string();
        if pmid.is_empty() {
            return Err(SourceError::Parse("PubMed article without PMID".into()));
        }
        let abstract_text = self
            .abstract_parts
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(RawRecord {
            url: format!("https://pubmed.ncbi.nlm.nih.gov/{}/", pmid),
            native_id: pmid,
            title: super::squash_whitespace(&self.title),
            authors: self.authors,
            abstract_text,
            published_date: self.pub_date.compose(),
        })
    }

    fn on_text(&mut self, path: &[String], text: &str) {
        let Some(tag) = path.last().map(String::as_str) else {
            return;
        };
        let parent = path.len().checked_sub(2).map(|i| path[i].as_str());
        let inside = |name: &str| path.iter().any(|t| t == name);

        if tag == "PMID" && !self.pmid_closed {
            self.pmid.push_str(text);
        } else if inside("ArticleTitle") {
            self.title.push_str(text);
        } else if inside("AbstractText") && inside("Abstract") {
            if let Some(part) = self.abstract_parts.last_mut() {
                part.push_str(text);
            }
        } else if parent == Some("Author") {
            if let Some((last, fore)) = self.author.as_mut() {
                match tag {
                    "LastName" => last.push_str(text),
                    "ForeName" => fore.push_str(text),
                    _ => {}
                }
            }
        } else if parent == Some("PubDate") && !self.pub_date_closed {
            match tag {
                "Year" => self.pub_date.year.push_str(text),
                "Month" => self.pub_date.month.push_str(text),
                "Day" => self.pub_date.day.push_str(text),
                "MedlineDate" => self.pub_date.medline.push_str(text),
                _ => {}
            }
        }
    }
}

/// Parse an `efetch` XML document into records. A `PubmedArticle` that
/// cannot become a record is logged and skipped.
fn parse_pubmed_xml(xml: &str) -> Result<Vec<RawRecord>, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut records = Vec::new();
    let mut current: Option<RecordBuilder> = None;
    let mut path: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if tag == "PubmedArticle" {
                    current = Some(RecordBuilder::default());
                } else if let Some(b) = current.as_mut() {
                    let parent = path.last().map(String::as_str);
                    match tag.as_str() {
                        "Author" => b.author = Some((String::new(), String::new())),
                        "AbstractText" if parent == Some("Abstract") => {
                            b.abstract_parts.push(String::new())
                        }
                        _ => {}
                    }
                }
                path.push(tag);
            }
            Ok(Event::Text(e)) => {
                if let Some(builder) = current.as_mut() {
                    match e.unescape() {
                        Ok(text) => builder.on_text(&path, &text),
                        Err(err) => {
                            builder.bad_text.get_or_insert_with(|| err.to_string());
                        }
                    }
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                path.pop();
                if tag == "PubmedArticle" {
                    if let Some(done) = current.take() {
                        match done.finish() {
                            Ok(record) => records.push(record),
                            Err(e) => tracing::warn!("Skipping PubMed article: {}", e),
                        }
                    }
                } else if let Some(b) = current.as_mut() {
                    match tag.as_str() {
                        "PMID" => b.pmid_closed = !b.pmid.trim().is_empty(),
                        "PubDate" => b.pub_date_closed = true,
                        "Author" => {
                            if let Some((last, fore)) = b.author.take() {
                                let (last, fore) = (last.trim(), fore.trim());
                                if !last.is_empty() && !fore.is_empty() {
                                    b.authors.push(format!("{} {}", fore, last));
                                }
                            }
                        }
                        _ => {}
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
