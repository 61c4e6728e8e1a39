//! Index catalog: resolving a source into concrete index endpoints
//!
//! A "source" is one of the known archive services or an arbitrary override
//! URL. The wayback-style service is one endpoint; the Common Crawl service
//! is sharded into one pywb-style index per crawl, enumerated by a remote
//! manifest (`collinfo.json`). The catalog caches that manifest — on disk
//! under the per-user cache directory, and in memory for the process
//! lifetime with single-flight population — and turns a source plus crawl
//! selectors or a time window into an ordered endpoint list.

pub mod selector;

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::query::{CrawlOrder, QuerySpec};
use crate::timeutil::{
    cc_index_special_time, cc_index_to_time, pad_timestamp_up, time_to_timestamp,
    timestamp_to_time,
};
use crate::transport::{FetchMode, Transport};
use crate::{CdxError, Result};

pub use selector::CrawlSelector;

const DEFAULT_CC_MIRROR: &str = "https://index.commoncrawl.org/";
const WAYBACK_CDX: &str = "https://web.archive.org/cdx/search/cdx";

/// Seconds in the windows used to derive missing time bounds.
const THREE_MONTHS: i64 = 3 * 30 * 86_400;
const ONE_YEAR: i64 = 365 * 86_400;

/// Which filter/paging dialect an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// pywb-style: jsonl pages, six filter modifiers, 400 past last page
    Pywb,
    /// wayback-style: json list-of-lists pages, regex filters only,
    /// empty body past last page
    Wayback,
}

/// Where queries are directed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// The sharded Common Crawl index
    CommonCrawl,
    /// The Internet Archive wayback CDX server
    InternetArchive,
    /// An arbitrary CDX server, assumed pywb-style
    Custom(String),
}

impl Source {
    /// Parses the CLI shorthand: `cc`, `ia`, or a URL.
    pub fn parse(raw: &str) -> Result<Source> {
        match raw {
            "cc" => Ok(Source::CommonCrawl),
            "ia" => Ok(Source::InternetArchive),
            url if url.starts_with("http://") || url.starts_with("https://") => {
                Ok(Source::Custom(url.to_string()))
            }
            other => Err(CdxError::Usage(format!(
                "could not understand source {:?}, expected cc, ia, or a URL",
                other
            ))),
        }
    }

    /// The default location content bytes are downloaded from, if the
    /// source has one.
    pub fn default_download_prefix(&self) -> Option<&'static str> {
        match self {
            Source::CommonCrawl => Some("https://data.commoncrawl.org"),
            _ => None,
        }
    }
}

/// One queryable remote index. Constructed per query, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEndpoint {
    pub kind: EndpointKind,
    /// Full query URL of the CDX API
    pub base: String,
    /// Shard id for sharded sources
    pub crawl_id: Option<String>,
    /// Unix time the shard's data runs up to, for range selection
    pub end_time: Option<i64>,
}

/// One entry of the Common Crawl collection manifest.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Collection {
    pub id: String,
    #[serde(rename = "cdx-api")]
    pub cdx_api: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub timegate: Option<String>,
}

impl Collection {
    /// The unix time this collection's data runs up to, decoded from its id.
    pub fn end_time(&self) -> Option<i64> {
        let rest = self.id.strip_prefix("CC-MAIN-")?;
        if let Some((y, w)) = rest.split_once('-') {
            if y.len() == 4 && w.len() == 2 && is_digits(y) && is_digits(w) {
                return cc_index_to_time(y.parse().ok()?, w.parse().ok()?);
            }
        }
        cc_index_special_time(rest)
    }
}

/// Resolves source selectors into ordered endpoint lists, caching the
/// remote shard manifest.
pub struct IndexCatalog {
    transport: Arc<Transport>,
    mirror: String,
    cache_path: Option<PathBuf>,
    // single-flight: the lock is held across the fetch that populates it
    manifest: Mutex<Option<Arc<Vec<Collection>>>>,
}

impl IndexCatalog {
    pub fn new(transport: Arc<Transport>) -> IndexCatalog {
        IndexCatalog {
            transport,
            mirror: DEFAULT_CC_MIRROR.to_string(),
            cache_path: default_cache_path(),
            manifest: Mutex::new(None),
        }
    }

    pub fn with_mirror(mut self, mirror: &str) -> IndexCatalog {
        self.mirror = mirror.trim_end_matches('/').to_string() + "/";
        self
    }

    /// Overrides the on-disk manifest cache location; `None` disables it.
    pub fn with_cache_path(mut self, path: Option<PathBuf>) -> IndexCatalog {
        self.cache_path = path;
        self
    }

    /// Resolves a source plus query bounds into the ordered endpoint list
    /// the merge iterator will consume.
    ///
    /// A selector that matches zero shards is a usage error, not an empty
    /// success.
    pub fn resolve(
        &self,
        source: &Source,
        spec: &QuerySpec,
        order: CrawlOrder,
        crawls: &[CrawlSelector],
    ) -> Result<Vec<IndexEndpoint>> {
        match source {
            Source::InternetArchive => Ok(vec![IndexEndpoint {
                kind: EndpointKind::Wayback,
                base: WAYBACK_CDX.to_string(),
                crawl_id: None,
                end_time: None,
            }]),
            Source::Custom(url) => Ok(vec![IndexEndpoint {
                kind: EndpointKind::Pywb,
                base: url.clone(),
                crawl_id: None,
                end_time: None,
            }]),
            Source::CommonCrawl => self.resolve_cc(spec, order, crawls),
        }
    }

    fn resolve_cc(
        &self,
        spec: &QuerySpec,
        order: CrawlOrder,
        crawls: &[CrawlSelector],
    ) -> Result<Vec<IndexEndpoint>> {
        let manifest = self.manifest(false)?;
        let mut cols: Vec<&Collection> = manifest.iter().collect();
        // manifest ids sort lexically oldest to newest
        cols.sort_by(|a, b| a.id.cmp(&b.id));

        let mut selected: Vec<&Collection> = if !crawls.is_empty() {
            let ids: Vec<&str> = cols.iter().map(|c| c.id.as_str()).collect();
            let mut keep = Vec::new();
            for sel in crawls {
                for id in sel.select(&ids)? {
                    if !keep.contains(&id) {
                        keep.push(id);
                    }
                }
            }
            keep.sort_unstable();
            cols.iter()
                .copied()
                .filter(|c| keep.contains(&c.id.as_str()))
                .collect()
        } else if spec.from_ts.is_some() || spec.to.is_some() || spec.closest.is_some() {
            self.filter_by_window(&cols, spec)?
        } else {
            cols
        };

        if selected.is_empty() {
            return Err(CdxError::Usage(
                "no Common Crawl shards match the requested selection".to_string(),
            ));
        }

        // mixed = shards newest first; each shard still returns its own
        // contents oldest first
        if order == CrawlOrder::Mixed {
            selected.reverse();
        }

        tracing::info!(
            first = %selected.first().map(|c| c.id.as_str()).unwrap_or(""),
            last = %selected.last().map(|c| c.id.as_str()).unwrap_or(""),
            count = selected.len(),
            "resolved cc shard range"
        );

        Ok(selected
            .into_iter()
            .map(|c| IndexEndpoint {
                kind: EndpointKind::Pywb,
                base: c.cdx_api.clone(),
                crawl_id: Some(c.id.clone()),
                end_time: c.end_time(),
            })
            .collect())
    }

    /// Intersects shard publish windows with the query's from/to bounds.
    fn filter_by_window<'a>(
        &self,
        cols: &[&'a Collection],
        spec: &QuerySpec,
    ) -> Result<Vec<&'a Collection>> {
        let from_t = match &spec.from_ts {
            Some(ts) => timestamp_to_time(ts)?,
            // callers fill defaults first; be permissive if they did not
            None => 0,
        };
        let to_t = match &spec.to {
            Some(ts) => Some(timestamp_to_time(&pad_timestamp_up(ts))?),
            None => None,
        };

        let mut dated: Vec<(&Collection, i64)> = cols
            .iter()
            .filter_map(|c| match c.end_time() {
                Some(t) => Some((*c, t)),
                None => {
                    tracing::warn!(id = %c.id, "cannot decode shard date, skipping");
                    None
                }
            })
            .collect();
        dated.sort_by_key(|(_, t)| *t);
        let times: Vec<i64> = dated.iter().map(|(_, t)| *t).collect();

        // a shard's end time is after the data it covers, so step one shard
        // earlier than the strict lower bound and one later than the upper
        let start = times.partition_point(|t| *t < from_t).saturating_sub(1);
        let end = match to_t {
            Some(to_t) => (times.partition_point(|t| *t <= to_t) + 1).min(times.len()),
            None => times.len(),
        };

        Ok(dated[start..end].iter().map(|(c, _)| *c).collect())
    }

    /// Fills the Common Crawl default time window into a query that lacks
    /// one: closest ± 3 months, else the year up to `to`, else the last
    /// year before `now`.
    pub fn apply_cc_defaults(spec: &mut QuerySpec, now: i64) -> Result<()> {
        if spec.from_ts.is_none() {
            if let Some(closest) = spec.closest.clone() {
                let closest_t = timestamp_to_time(&closest)?;
                spec.from_ts = Some(time_to_timestamp(closest_t - THREE_MONTHS));
                tracing::info!(from = %spec.from_ts.as_deref().unwrap_or(""), "no from but closest, derived from");
                if spec.to.is_none() {
                    spec.to = Some(time_to_timestamp(closest_t + THREE_MONTHS));
                }
            } else if let Some(to) = spec.to.clone() {
                let to_t = timestamp_to_time(&pad_timestamp_up(&to))?;
                spec.from_ts = Some(time_to_timestamp(to_t - ONE_YEAR));
                tracing::info!(from = %spec.from_ts.as_deref().unwrap_or(""), "no from but to, derived from");
            } else {
                spec.from_ts = Some(time_to_timestamp(now - ONE_YEAR));
                tracing::info!(from = %spec.from_ts.as_deref().unwrap_or(""), "no from, defaulting to the last year");
            }
        }
        if spec.to.is_none() {
            if let Some(closest) = spec.closest.clone() {
                let closest_t = timestamp_to_time(&closest)?;
                spec.to = Some(time_to_timestamp(closest_t + THREE_MONTHS));
            }
        }
        Ok(())
    }

    /// Returns the shard manifest, fetching it at most once per process.
    ///
    /// Population order: memoized copy, then the on-disk cache (which never
    /// expires on its own), then the remote mirror. `force_refresh` skips
    /// the caches.
    pub fn manifest(&self, force_refresh: bool) -> Result<Arc<Vec<Collection>>> {
        let mut guard = self.manifest.lock().unwrap_or_else(|e| e.into_inner());
        if !force_refresh {
            if let Some(manifest) = guard.as_ref() {
                return Ok(Arc::clone(manifest));
            }
            if let Some(cached) = self.read_disk_cache() {
                let manifest = Arc::new(cached);
                *guard = Some(Arc::clone(&manifest));
                return Ok(Arc::clone(&manifest));
            }
        }

        let url = format!("{}collinfo.json", self.mirror);
        tracing::info!(url, "fetching collection manifest");
        let resp = self.transport.fetch(&url, &[], FetchMode::Strict)?;
        let cols: Vec<Collection> = serde_json::from_slice(&resp.body).map_err(|e| {
            CdxError::Decode {
                url: url.clone(),
                message: e.to_string(),
            }
        })?;
        if cols.is_empty() {
            return Err(CdxError::Decode {
                url,
                message: "collection manifest is empty".to_string(),
            });
        }
        tracing::info!(count = cols.len(), "collection manifest loaded");

        self.write_disk_cache(&cols);
        let manifest = Arc::new(cols);
        *guard = Some(Arc::clone(&manifest));
        Ok(manifest)
    }

    fn read_disk_cache(&self) -> Option<Vec<Collection>> {
        let path = self.cache_path.as_ref()?;
        let bytes = fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(cols) => {
                tracing::debug!(path = %path.display(), "loaded collection manifest from cache");
                Some(cols)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable manifest cache");
                None
            }
        }
    }

    fn write_disk_cache(&self, cols: &[Collection]) {
        let Some(path) = self.cache_path.as_ref() else {
            return;
        };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, serde_json::to_vec(cols)?)?;
            Ok(())
        };
        if let Err(e) = write() {
            tracing::warn!(path = %path.display(), error = %e, "could not write manifest cache");
        }
    }
}

fn default_cache_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("cdxfetch").join("collinfo.json"))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(id: &str) -> Collection {
        Collection {
            id: id.to_string(),
            cdx_api: format!("https://index.example.org/{}-index", id),
            name: None,
            timegate: None,
        }
    }

    #[test]
    fn test_source_parse() {
        assert_eq!(Source::parse("cc").unwrap(), Source::CommonCrawl);
        assert_eq!(Source::parse("ia").unwrap(), Source::InternetArchive);
        assert_eq!(
            Source::parse("https://my.pywb.example/cdx").unwrap(),
            Source::Custom("https://my.pywb.example/cdx".to_string())
        );
        assert!(Source::parse("bogus").is_err());
    }

    #[test]
    fn test_collection_end_time() {
        assert_eq!(col("CC-MAIN-2018-02").end_time(), Some(1_515_888_000));
        assert!(col("CC-MAIN-2012").end_time().is_some());
        assert!(col("SOMETHING-ELSE").end_time().is_none());
    }

    #[test]
    fn test_apply_cc_defaults_closest() {
        let mut spec = QuerySpec::new("example.com");
        spec.closest = Some("20170101000000".to_string());
        IndexCatalog::apply_cc_defaults(&mut spec, 1_600_000_000).unwrap();
        assert_eq!(spec.from_ts.as_deref(), Some("20161003000000"));
        assert_eq!(spec.to.as_deref(), Some("20170401000000"));
    }

    #[test]
    fn test_apply_cc_defaults_bare() {
        let mut spec = QuerySpec::new("example.com");
        // 2020-09-13T12:26:40Z
        IndexCatalog::apply_cc_defaults(&mut spec, 1_600_000_000).unwrap();
        assert_eq!(spec.from_ts.as_deref(), Some("20190914122640"));
        assert!(spec.to.is_none());
    }

    #[test]
    fn test_apply_cc_defaults_to_only() {
        let mut spec = QuerySpec::new("example.com");
        spec.to = Some("2017".to_string());
        IndexCatalog::apply_cc_defaults(&mut spec, 1_600_000_000).unwrap();
        // one year before the padded end of 2017
        assert_eq!(spec.from_ts.as_deref(), Some("20161231235959"));
    }

    #[test]
    fn test_window_filter_brackets_range() {
        let cols_owned = vec![
            col("CC-MAIN-2019-04"),
            col("CC-MAIN-2019-51"),
            col("CC-MAIN-2020-05"),
            col("CC-MAIN-2020-50"),
            col("CC-MAIN-2021-10"),
        ];
        let cols: Vec<&Collection> = cols_owned.iter().collect();
        let transport = Arc::new(Transport::new().unwrap());
        let catalog = IndexCatalog::new(transport).with_cache_path(None);

        let mut spec = QuerySpec::new("example.com");
        spec.from_ts = Some("20200101".to_string());
        spec.to = Some("20200601".to_string());
        let got = catalog.filter_by_window(&cols, &spec).unwrap();
        let ids: Vec<&str> = got.iter().map(|c| c.id.as_str()).collect();
        // one shard before the lower bound and one after the upper are kept
        assert!(ids.contains(&"CC-MAIN-2019-51"));
        assert!(ids.contains(&"CC-MAIN-2020-05"));
        assert!(ids.contains(&"CC-MAIN-2020-50"));
        assert!(!ids.contains(&"CC-MAIN-2019-04"));
    }
}
