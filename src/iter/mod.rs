//! The virtual-index engine
//!
//! Presents the ordered endpoint list the catalog resolved as one lazy,
//! finite, forward-only sequence of capture records. Each endpoint is
//! consumed page by page in lock-step; a page is fetched only when the
//! caller asks for a record none of the buffered pages can supply. Each
//! endpoint's own output arrives ascending by (urlkey, timestamp) — a
//! property of the remote services this iterator relies on but does not
//! enforce. The caller's limit is enforced here, client-side, as the final
//! gate on yielded records.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::catalog::{CrawlSelector, EndpointKind, IndexCatalog, IndexEndpoint, Source};
use crate::fetch::{self, Page};
use crate::query::{CrawlOrder, QuerySpec};
use crate::record::CaptureRecord;
use crate::transport::{CancelToken, RetryPolicy, Transport};
use crate::Result;

/// Entry point tying the catalog, transport, and iterator together.
///
/// Construct one per process and thread it through calls; the manifest
/// cache lives inside its catalog, never in a hidden global.
pub struct CdxFetcher {
    transport: Arc<Transport>,
    catalog: IndexCatalog,
    source: Source,
    order: CrawlOrder,
    crawls: Vec<CrawlSelector>,
    warc_download_prefix: Option<String>,
}

impl CdxFetcher {
    pub fn new(source: Source) -> Result<CdxFetcher> {
        CdxFetcher::with_transport(source, Transport::new()?)
    }

    pub fn with_cancel(source: Source, cancel: CancelToken) -> Result<CdxFetcher> {
        CdxFetcher::with_transport(
            source,
            Transport::with_policy(RetryPolicy::default(), cancel)?,
        )
    }

    pub fn with_transport(source: Source, transport: Transport) -> Result<CdxFetcher> {
        let transport = Arc::new(transport);
        let catalog = IndexCatalog::new(Arc::clone(&transport));
        let warc_download_prefix = source.default_download_prefix().map(|p| p.to_string());
        Ok(CdxFetcher {
            transport,
            catalog,
            source,
            order: CrawlOrder::default(),
            crawls: Vec::new(),
            warc_download_prefix,
        })
    }

    pub fn with_mirror(mut self, mirror: &str) -> CdxFetcher {
        self.catalog = self.catalog.with_mirror(mirror);
        self
    }

    pub fn with_cache_path(mut self, path: Option<std::path::PathBuf>) -> CdxFetcher {
        self.catalog = self.catalog.with_cache_path(path);
        self
    }

    pub fn with_order(mut self, order: CrawlOrder) -> CdxFetcher {
        self.order = order;
        self
    }

    pub fn with_crawls(mut self, crawls: Vec<CrawlSelector>) -> CdxFetcher {
        self.crawls = crawls;
        self
    }

    pub fn with_warc_download_prefix(mut self, prefix: Option<String>) -> CdxFetcher {
        self.warc_download_prefix = prefix.or(self.warc_download_prefix);
        self
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn warc_download_prefix(&self) -> Option<&str> {
        self.warc_download_prefix.as_deref()
    }

    /// Applies source defaults and resolves the endpoint list.
    fn prepare(&self, spec: &QuerySpec) -> Result<(QuerySpec, Vec<IndexEndpoint>)> {
        let mut spec = spec.clone();
        spec.validate()?;
        // explicit shard selection replaces the derived time window
        if self.source == Source::CommonCrawl && self.crawls.is_empty() {
            IndexCatalog::apply_cc_defaults(&mut spec, crate::timeutil::now())?;
        }
        let endpoints = self
            .catalog
            .resolve(&self.source, &spec, self.order, &self.crawls)?;
        Ok((spec, endpoints))
    }

    /// Streams matching records lazily. The returned iterator is
    /// forward-only and not restartable.
    pub fn iter(&self, spec: &QuerySpec) -> Result<CaptureIter> {
        let limit = spec.effective_limit(false);
        let (spec, endpoints) = self.prepare(spec)?;
        Ok(CaptureIter::new(
            Arc::clone(&self.transport),
            spec,
            endpoints,
            limit,
        ))
    }

    /// One-shot query: collects up to the (smaller) get-mode limit.
    pub fn get(&self, spec: &QuerySpec) -> Result<Vec<CaptureRecord>> {
        let limit = spec.effective_limit(true);
        let (spec, endpoints) = self.prepare(spec)?;
        let mut iter = CaptureIter::new(Arc::clone(&self.transport), spec, endpoints, limit);
        let mut out = Vec::new();
        for rec in &mut iter {
            out.push(rec?);
        }
        Ok(out)
    }

    /// Imprecise estimate of how many captures match, derived from the
    /// services' page counts.
    pub fn size_estimate(&self, spec: &QuerySpec) -> Result<SizeEstimate> {
        let (spec, endpoints) = self.prepare(spec)?;
        let mut estimate = SizeEstimate::default();
        for endpoint in &endpoints {
            let pages = fetch::fetch_num_pages(&self.transport, endpoint, &spec)?;
            let samples = fetch::pages_to_samples(pages);
            estimate.pages += pages;
            estimate.samples += samples;
            estimate
                .per_endpoint
                .push((endpoint.base.clone(), samples));
            if let Some(limit) = spec.limit {
                if estimate.samples > limit {
                    break;
                }
            }
        }
        Ok(estimate)
    }
}

/// Result of [`CdxFetcher::size_estimate`].
#[derive(Debug, Default)]
pub struct SizeEstimate {
    pub pages: u64,
    pub samples: u64,
    /// (endpoint, samples) pairs, for detailed output
    pub per_endpoint: Vec<(String, u64)>,
}

/// Lazy merged record stream across an ordered endpoint list.
pub struct CaptureIter {
    transport: Arc<Transport>,
    spec: QuerySpec,
    endpoints: Vec<IndexEndpoint>,
    endpoint_idx: usize,
    page: u64,
    buffer: VecDeque<CaptureRecord>,
    /// Records still allowed out; the hard ceiling
    remaining: u64,
    /// Set after yielding an error; the stream is over
    failed: bool,
}

impl CaptureIter {
    fn new(
        transport: Arc<Transport>,
        spec: QuerySpec,
        endpoints: Vec<IndexEndpoint>,
        limit: u64,
    ) -> CaptureIter {
        CaptureIter {
            transport,
            spec,
            endpoints,
            endpoint_idx: 0,
            page: 0,
            buffer: VecDeque::new(),
            remaining: limit,
            failed: false,
        }
    }

    /// Whether the current endpoint needs client-side distance sorting for
    /// a `closest` query.
    fn needs_client_sort(&self, endpoint: &IndexEndpoint) -> bool {
        self.spec.closest.is_some() && endpoint.kind != EndpointKind::Wayback
    }

    /// Refills the buffer from the next non-empty page, advancing across
    /// endpoints as they exhaust. Empty buffer afterwards means the virtual
    /// index is exhausted.
    fn get_more(&mut self) -> Result<()> {
        while self.buffer.is_empty() {
            let Some(endpoint) = self.endpoints.get(self.endpoint_idx) else {
                return Ok(());
            };
            if self.page == 0 {
                tracing::info!(endpoint = %endpoint.base, "fetching cdx pages");
            }

            if self.needs_client_sort(endpoint) {
                // distance sort needs the whole endpoint before anything
                // can be yielded; per-shard-then-merge. No server-side
                // limit here: the server would truncate in index order,
                // cutting off the captures nearest the target. The from/to
                // window bounds the neighborhood instead.
                let mut collected = Vec::new();
                loop {
                    match fetch::fetch_page(
                        &self.transport,
                        endpoint,
                        &self.spec,
                        self.page,
                        None,
                    )? {
                        Page::Records(mut recs) => {
                            collected.append(&mut recs);
                            self.page += 1;
                        }
                        Page::Done => break,
                    }
                }
                if let Some(closest) = &self.spec.closest {
                    fetch::sort_by_distance(&mut collected, closest);
                }
                collected.truncate(self.remaining as usize);
                self.buffer.extend(collected);
                self.endpoint_idx += 1;
                self.page = 0;
                continue;
            }

            match fetch::fetch_page(
                &self.transport,
                endpoint,
                &self.spec,
                self.page,
                Some(self.remaining),
            )? {
                Page::Records(recs) => {
                    tracing::debug!(count = recs.len(), page = self.page, "got page");
                    self.page += 1;
                    self.buffer.extend(recs);
                }
                Page::Done => {
                    tracing::debug!(endpoint = %endpoint.base, "endpoint exhausted");
                    self.endpoint_idx += 1;
                    self.page = 0;
                }
            }
        }
        Ok(())
    }
}

impl Iterator for CaptureIter {
    type Item = Result<CaptureRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        if self.buffer.is_empty() {
            if let Err(e) = self.get_more() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        match self.buffer.pop_front() {
            Some(rec) => {
                self.remaining -= 1;
                Some(Ok(rec))
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{normalize_row, Page};

    fn rec(ts: &str) -> CaptureRecord {
        normalize_row(
            vec![
                ("urlkey".to_string(), "com,example)/".to_string()),
                ("timestamp".to_string(), ts.to_string()),
                ("url".to_string(), "http://example.com/".to_string()),
                ("status".to_string(), "200".to_string()),
            ],
            EndpointKind::Pywb,
        )
    }

    #[test]
    fn test_limit_is_hard_gate() {
        let transport = Arc::new(Transport::new().unwrap());
        let mut iter = CaptureIter::new(transport, QuerySpec::new("example.com"), Vec::new(), 2);
        // pre-filled buffer stands in for fetched pages
        iter.buffer.extend(vec![
            rec("20170101000000"),
            rec("20170102000000"),
            rec("20170103000000"),
        ]);
        let got: Vec<_> = iter.by_ref().collect();
        assert_eq!(got.len(), 2);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_empty_endpoint_list_yields_nothing() {
        let transport = Arc::new(Transport::new().unwrap());
        let mut iter = CaptureIter::new(transport, QuerySpec::new("example.com"), Vec::new(), 10);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_page_decoding_types_line_up() {
        // Page variants drive the iterator's endpoint advance
        assert!(matches!(
            crate::fetch::decode_page("u", 400, "", EndpointKind::Pywb).unwrap(),
            Page::Done
        ));
    }
}
