use std::cmp::Ordering;

use crate::apis::Article;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Relevance,
    Citations,
    Date,
}

impl SortBy {
    /// Exact, case-sensitive match. Anything else falls back to relevance.
    pub fn parse(s: &str) -> Self {
        match s {
            "citations" => Self::Citations,
            "date" => Self::Date,
            _ => Self::Relevance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    /// Descending only for `desc` (any case); everything else is ascending.
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("desc") {
            Self::Desc
        } else {
            Self::Asc
        }
    }

    fn apply(self, ord: Ordering) -> Ordering {
        match self {
            Self::Asc => ord,
            Self::Desc => ord.reverse(),
        }
    }
}

fn relevance(a: &Article, b: &Article) -> Ordering {
    let ra = a.ranking.unwrap_or(0.0);
    let rb = b.ranking.unwrap_or(0.0);
    rb.total_cmp(&ra)
}

/// Stable sort. Relevance is always most relevant first, whatever `order`
/// says, and breaks ties on the citation and date keys.
pub fn sort_articles(articles: &mut [Article], by: SortBy, order: SortOrder) {
    match by {
        SortBy::Citations => articles.sort_by(|a, b| {
            order
                .apply(a.citations.cmp(&b.citations))
                .then_with(|| relevance(a, b))
        }),
        SortBy::Date => articles.sort_by(|a, b| {
            order
                .apply(a.published_date.cmp(&b.published_date))
                .then_with(|| relevance(a, b))
        }),
        SortBy::Relevance => articles.sort_by(relevance),
    }
}
