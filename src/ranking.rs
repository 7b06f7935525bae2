//! Composite relevance score: citation impact blended with publication recency.

use chrono::NaiveDate;

use crate::apis::Article;

const CITATION_WEIGHT: f64 = 0.7;
const RECENCY_WEIGHT: f64 = 0.3;

/// `ln(citations + 1) / 10`.
pub fn citation_score(citations: u64) -> f64 {
    (citations as f64 + 1.0).ln() / 10.0
}

/// `1 / (days_old + 1)` for a date whose first ten characters are
/// `YYYY-MM-DD`, with future dates clamped to zero days old. Anything
/// less precise than a full day scores 0.
pub fn recency_score(published_date: &str, today: NaiveDate) -> f64 {
    let Some(day) = published_date.get(..10) else {
        return 0.0;
    };
    let Ok(published) = NaiveDate::parse_from_str(day, "%Y-%m-%d") else {
        return 0.0;
    };
    let days_old = (today - published).num_days().max(0);
    1.0 / (days_old as f64 + 1.0)
}

pub fn score(article: &Article, today: NaiveDate) -> f64 {
    let value = CITATION_WEIGHT * citation_score(article.citations)
        + RECENCY_WEIGHT * recency_score(&article.published_date, today);
    if value.is_finite() {
        value
    } else {
        tracing::warn!("Non-finite ranking for {}, using 0", article.id);
        0.0
    }
}

/// Assign `ranking` on every article, all measured against the same day.
pub fn rank_all(articles: &mut [Article], today: NaiveDate) {
    for article in articles.iter_mut() {
        article.ranking = Some(score(article, today));
    }
}
