use crate::apis::Article;

/// Keep articles whose publication year lies in the inclusive range.
///
/// With no bounds the input comes back untouched. Once either bound is set,
/// articles without a usable year are dropped, and a bound that is not a
/// number matches nothing.
pub fn filter_by_year(
    articles: Vec<Article>,
    start_year: Option<&str>,
    end_year: Option<&str>,
) -> Vec<Article> {
    let start_year = start_year.map(str::trim).filter(|s| !s.is_empty());
    let end_year = end_year.map(str::trim).filter(|s| !s.is_empty());
    if start_year.is_none() && end_year.is_none() {
        return articles;
    }

    let (start, end) = match (parse_bound(start_year), parse_bound(end_year)) {
        (Ok(start), Ok(end)) => (start, end),
        (Err(bad), _) | (_, Err(bad)) => {
            tracing::warn!("Unusable year bound {:?}, no article can match", bad);
            return Vec::new();
        }
    };

    articles
        .into_iter()
        .filter(|a| match leading_year(&a.published_date) {
            Some(year) => start.is_none_or(|s| year >= s) && end.is_none_or(|e| year <= e),
            None => false,
        })
        .collect()
}

fn parse_bound(bound: Option<&str>) -> Result<Option<i32>, &str> {
    bound.map(|b| b.parse::<i32>().map_err(|_| b)).transpose()
}

/// The 4-digit year a date string starts with.
pub fn leading_year(date: &str) -> Option<i32> {
    let year = date.get(..4)?;
    if !year.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    year.parse().ok()
}
