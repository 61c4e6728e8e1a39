//! Crawl selector parsing
//!
//! A sharded source is queried through a subset of its shards. Callers name
//! that subset with selectors: an explicit shard id (`CC-MAIN-2024-33`), a
//! small count meaning "the N most recent shards", a year (`2019`), or a
//! year range (`2019-2021`). Years match shard ids by prefix.

use crate::{CdxError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlSelector {
    /// Explicit shard id
    Id(String),
    /// The N most recent shards
    Latest(usize),
    /// All shards whose id starts with `CC-MAIN-<year>` for a year in range
    Years(u16, u16),
}

impl CrawlSelector {
    /// Parses one selector string.
    pub fn parse(raw: &str) -> Result<CrawlSelector> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CdxError::Usage("empty crawl selector".to_string()));
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            if raw.len() <= 3 {
                let n: usize = raw
                    .parse()
                    .map_err(|_| CdxError::Usage(format!("bad crawl count {:?}", raw)))?;
                if n == 0 {
                    return Err(CdxError::Usage("crawl count must be at least 1".to_string()));
                }
                return Ok(CrawlSelector::Latest(n));
            }
            if raw.len() == 4 {
                let year: u16 = raw.parse().unwrap_or(0);
                return Ok(CrawlSelector::Years(year, year));
            }
            return Err(CdxError::Usage(format!(
                "crawl selector {:?} is neither a count nor a year",
                raw
            )));
        }
        if let Some((a, b)) = raw.split_once('-') {
            if a.len() == 4 && b.len() == 4 && is_digits(a) && is_digits(b) {
                let (start, end) = (a.parse().unwrap_or(0), b.parse().unwrap_or(0));
                if start > end {
                    return Err(CdxError::Usage(format!(
                        "crawl year range {:?} runs backwards",
                        raw
                    )));
                }
                return Ok(CrawlSelector::Years(start, end));
            }
        }
        Ok(CrawlSelector::Id(raw.to_string()))
    }

    /// Selects matching shard ids out of `ids`, which must be sorted oldest
    /// to newest. The result keeps that order.
    pub fn select<'a>(&self, ids: &[&'a str]) -> Result<Vec<&'a str>> {
        let matched: Vec<&str> = match self {
            CrawlSelector::Id(want) => {
                ids.iter().copied().filter(|id| *id == want).collect()
            }
            CrawlSelector::Latest(n) => {
                let skip = ids.len().saturating_sub(*n);
                ids[skip..].to_vec()
            }
            CrawlSelector::Years(start, end) => ids
                .iter()
                .copied()
                .filter(|id| {
                    (*start..=*end)
                        .any(|year| id.starts_with(&format!("CC-MAIN-{}", year)))
                })
                .collect(),
        };
        if matched.is_empty() {
            return Err(CdxError::Usage(format!(
                "crawl selector {:?} matched no shards",
                self
            )));
        }
        Ok(matched)
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDS: &[&str] = &[
        "CC-MAIN-2019-04",
        "CC-MAIN-2019-51",
        "CC-MAIN-2020-05",
        "CC-MAIN-2021-10",
        "CC-MAIN-2024-33",
    ];

    #[test]
    fn test_parse_forms() {
        assert_eq!(CrawlSelector::parse("3").unwrap(), CrawlSelector::Latest(3));
        assert_eq!(
            CrawlSelector::parse("2019").unwrap(),
            CrawlSelector::Years(2019, 2019)
        );
        assert_eq!(
            CrawlSelector::parse("2019-2021").unwrap(),
            CrawlSelector::Years(2019, 2021)
        );
        assert_eq!(
            CrawlSelector::parse("CC-MAIN-2024-33").unwrap(),
            CrawlSelector::Id("CC-MAIN-2024-33".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(CrawlSelector::parse("").is_err());
        assert!(CrawlSelector::parse("0").is_err());
        assert!(CrawlSelector::parse("2021-2019").is_err());
        assert!(CrawlSelector::parse("20190").is_err());
    }

    #[test]
    fn test_select_latest() {
        let got = CrawlSelector::Latest(2).select(IDS).unwrap();
        assert_eq!(got, vec!["CC-MAIN-2021-10", "CC-MAIN-2024-33"]);
        // more than available is everything
        assert_eq!(CrawlSelector::Latest(99).select(IDS).unwrap().len(), 5);
    }

    #[test]
    fn test_select_years() {
        let got = CrawlSelector::Years(2019, 2020).select(IDS).unwrap();
        assert_eq!(
            got,
            vec!["CC-MAIN-2019-04", "CC-MAIN-2019-51", "CC-MAIN-2020-05"]
        );
    }

    #[test]
    fn test_select_id() {
        let got = CrawlSelector::Id("CC-MAIN-2020-05".to_string())
            .select(IDS)
            .unwrap();
        assert_eq!(got, vec!["CC-MAIN-2020-05"]);
    }

    #[test]
    fn test_zero_matches_is_usage_error() {
        let err = CrawlSelector::Years(1999, 1999).select(IDS).unwrap_err();
        assert!(matches!(err, CdxError::Usage(_)));
    }
}
