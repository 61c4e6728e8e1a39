//! Integration tests for the cdx client
//!
//! These tests use wiremock to stand in for remote CDX services and
//! exercise the full query cycle end-to-end. The crate's HTTP client is
//! blocking, so each test holds a tokio runtime for the mock server and
//! drives the client from the test thread.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use cdxfetch::record::CaptureRecord;
use cdxfetch::transport::{FetchMode, RetryPolicy, Transport};
use cdxfetch::warc::{HttpRangeSource, Materializer, WarcInfo, WarcRecord, WarcWriter};
use cdxfetch::{CancelToken, CdxError, CdxFetcher, QuerySpec, Source};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Matches any request whose query string carries the named parameter,
/// whatever its value.
struct HasQueryParam(&'static str);

impl wiremock::Match for HasQueryParam {
    fn matches(&self, request: &Request) -> bool {
        request.url.query_pairs().any(|(k, _)| k == self.0)
    }
}

/// A mock server plus the runtime that keeps it alive. The server is
/// declared first so it shuts down before its runtime drops.
struct MockCdx {
    server: MockServer,
    rt: tokio::runtime::Runtime,
}

impl MockCdx {
    fn start() -> MockCdx {
        let rt = tokio::runtime::Runtime::new().expect("Failed to create runtime");
        let server = rt.block_on(MockServer::start());
        MockCdx { server, rt }
    }

    fn mount(&self, mock: Mock) {
        self.rt.block_on(mock.mount(&self.server));
    }

    fn uri(&self) -> String {
        self.server.uri()
    }
}

/// One pywb-style jsonl row for the given timestamp.
fn jsonl_row(ts: &str, url: &str) -> String {
    format!(
        concat!(
            r#"{{"urlkey": "com,example)/", "timestamp": "{}", "url": "{}", "#,
            r#""status": "200", "mime": "text/html", "digest": "AAAA", "#,
            r#""length": "100", "offset": "0", "filename": "crawl/a.warc.gz"}}"#
        ),
        ts, url
    )
}

fn custom_fetcher(cdx_url: &str) -> CdxFetcher {
    CdxFetcher::new(Source::Custom(cdx_url.to_string())).expect("Failed to create fetcher")
}

#[test]
fn test_paged_iteration_stops_at_limit() {
    let mock = MockCdx::start();

    let page0 = format!(
        "{}\n{}\n",
        jsonl_row("20170101000000", "http://example.com/a"),
        jsonl_row("20170102000000", "http://example.com/b")
    );
    let page1 = format!(
        "{}\n{}\n",
        jsonl_row("20170103000000", "http://example.com/c"),
        jsonl_row("20170104000000", "http://example.com/d")
    );

    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .and(query_param("page", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page0)),
    );
    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page1)),
    );
    // the limit is reached inside page 1, so page 2 must never be asked for
    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(400))
            .expect(0),
    );

    let fetcher = custom_fetcher(&format!("{}/cdx", mock.uri()));
    let mut spec = QuerySpec::new("example.com/*");
    spec.limit = Some(3);

    let records: Vec<CaptureRecord> = fetcher
        .iter(&spec)
        .expect("Failed to start iteration")
        .collect::<Result<_, _>>()
        .expect("Iteration failed");

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].url, "http://example.com/a");
    assert_eq!(records[1].url, "http://example.com/b");
    assert_eq!(records[2].url, "http://example.com/c");
}

#[test]
fn test_iteration_drains_all_pages() {
    let mock = MockCdx::start();

    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .and(query_param("page", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{}\n{}\n",
                jsonl_row("20170101000000", "http://example.com/a"),
                jsonl_row("20170102000000", "http://example.com/b")
            ))),
    );
    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{}\n",
                jsonl_row("20170103000000", "http://example.com/c")
            ))),
    );
    // pywb answers 400 past the last page
    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .respond_with(ResponseTemplate::new(400)),
    );

    let fetcher = custom_fetcher(&format!("{}/cdx", mock.uri()));
    let records: Vec<CaptureRecord> = fetcher
        .iter(&QuerySpec::new("example.com/*"))
        .expect("Failed to start iteration")
        .collect::<Result<_, _>>()
        .expect("Iteration failed");

    assert_eq!(records.len(), 3);
    assert_eq!(records[2].timestamp, "20170103000000");
}

#[test]
fn test_rate_limited_request_is_retried() {
    let mock = MockCdx::start();

    // the first request is rate limited, every later one succeeds
    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1),
    );
    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .and(query_param("page", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{}\n",
                jsonl_row("20170101000000", "http://example.com/a")
            ))),
    );
    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .respond_with(ResponseTemplate::new(400)),
    );

    let fetcher = custom_fetcher(&format!("{}/cdx", mock.uri()));
    let records = fetcher
        .get(&QuerySpec::new("example.com"))
        .expect("Retried fetch failed");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].url, "http://example.com/a");
}

#[test]
fn test_closest_collects_whole_neighborhood_before_sorting() {
    let mock = MockCdx::start();

    // a server honoring a limit would truncate in index order, cutting off
    // the captures nearest the target; closest queries must not send one
    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .and(HasQueryParam("limit"))
            .respond_with(ResponseTemplate::new(400))
            .expect(0),
    );
    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .and(query_param("page", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{}\n{}\n{}\n{}\n{}\n",
                jsonl_row("20150101000000", "http://example.com/"),
                jsonl_row("20150601000000", "http://example.com/"),
                jsonl_row("20160101000000", "http://example.com/"),
                jsonl_row("20161230000000", "http://example.com/"),
                jsonl_row("20170102000000", "http://example.com/")
            ))),
    );
    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .respond_with(ResponseTemplate::new(400)),
    );

    let fetcher = custom_fetcher(&format!("{}/cdx", mock.uri()));
    let mut spec = QuerySpec::new("example.com");
    spec.closest = Some("20170101000000".to_string());
    spec.limit = Some(3);

    let records: Vec<CaptureRecord> = fetcher
        .iter(&spec)
        .expect("Failed to start iteration")
        .collect::<Result<_, _>>()
        .expect("Iteration failed");

    let timestamps: Vec<&str> = records.iter().map(|r| r.timestamp.as_str()).collect();
    assert_eq!(
        timestamps,
        vec!["20170102000000", "20161230000000", "20160101000000"]
    );
}

#[test]
fn test_cancel_interrupts_rate_limit_backoff() {
    let mock = MockCdx::start();

    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .respond_with(ResponseTemplate::new(429)),
    );

    let cancel = CancelToken::new();
    let transport =
        Transport::with_policy(RetryPolicy::default(), cancel.clone()).expect("Failed to build");

    let canceller = {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        })
    };

    let err = transport
        .fetch(&format!("{}/cdx", mock.uri()), &[], FetchMode::Cdx)
        .expect_err("Cancelled fetch should not succeed");
    canceller.join().expect("Canceller thread panicked");

    // cancellation is its own failure class, not a retry exhaustion
    assert!(matches!(err, CdxError::Cancelled { .. }));
}

#[test]
fn test_no_captures_is_an_empty_stream() {
    let mock = MockCdx::start();

    // pywb answers 404 with an error object when nothing matches
    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_string(r#"{"error": "No Captures found for: nothing.example"}"#),
            ),
    );

    let fetcher = custom_fetcher(&format!("{}/cdx", mock.uri()));
    let records = fetcher
        .get(&QuerySpec::new("nothing.example"))
        .expect("Empty result should not be an error");
    assert!(records.is_empty());
}

#[test]
fn test_size_estimate_from_page_count() {
    let mock = MockCdx::start();

    mock.mount(
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .and(query_param("showNumPages", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"blocks": 3}"#)),
    );

    let fetcher = custom_fetcher(&format!("{}/cdx", mock.uri()));
    let estimate = fetcher
        .size_estimate(&QuerySpec::new("example.com/*"))
        .expect("Size estimate failed");

    assert_eq!(estimate.pages, 3);
    // pages discount the partial first and last page, at 3000 lines each
    assert_eq!(estimate.samples, 6000);
    assert_eq!(estimate.per_endpoint.len(), 1);
}

#[test]
fn test_cc_shards_query_newest_first_and_manifest_is_cached() {
    let mock = MockCdx::start();
    let base = mock.uri();

    let manifest = format!(
        r#"[
            {{"id": "CC-MAIN-2017-04", "name": "January 2017", "cdx-api": "{base}/CC-MAIN-2017-04-index"}},
            {{"id": "CC-MAIN-2017-09", "name": "February 2017", "cdx-api": "{base}/CC-MAIN-2017-09-index"}}
        ]"#
    );
    // the second fetcher must come from the disk cache, not the network
    mock.mount(
        Mock::given(method("GET"))
            .and(path("/collinfo.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(manifest))
            .expect(1),
    );

    for (shard, ts) in [
        ("CC-MAIN-2017-04-index", "20170125000000"),
        ("CC-MAIN-2017-09-index", "20170301000000"),
    ] {
        mock.mount(
            Mock::given(method("GET"))
                .and(path(format!("/{}", shard)))
                .and(query_param("page", "0"))
                .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                    "{}\n",
                    jsonl_row(ts, "http://example.com/")
                ))),
        );
        mock.mount(
            Mock::given(method("GET"))
                .and(path(format!("/{}", shard)))
                .respond_with(ResponseTemplate::new(400)),
        );
    }

    let cache_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let cache_path = cache_dir.path().join("collinfo.json");

    let mut spec = QuerySpec::new("example.com");
    spec.from_ts = Some("20170101000000".to_string());
    spec.to = Some("20171231235959".to_string());

    for _ in 0..2 {
        let fetcher = CdxFetcher::new(Source::CommonCrawl)
            .expect("Failed to create fetcher")
            .with_mirror(&base)
            .with_cache_path(Some(cache_path.clone()));

        let records: Vec<CaptureRecord> = fetcher
            .iter(&spec)
            .expect("Failed to start iteration")
            .collect::<Result<_, _>>()
            .expect("Iteration failed");

        // mixed order: the newest shard's captures come first
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp, "20170301000000");
        assert_eq!(records[1].timestamp, "20170125000000");
        assert!(cache_path.exists());
    }
}

#[test]
fn test_warc_extraction_over_http() {
    let mock = MockCdx::start();

    let mut stored = WarcRecord::new("response");
    stored.set_header("WARC-Target-URI", "http://example.com/");
    stored.set_header("WARC-Date", "2017-01-01T00:00:00Z");
    stored.body = b"HTTP/1.1 200 OK\r\n\r\nhello".to_vec();
    let stored_bytes = stored.to_bytes();
    let stored_len = stored_bytes.len() as u64;

    mock.mount(
        Mock::given(method("GET"))
            .and(path("/warcs/crawl/a.warc.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(stored_bytes)),
    );

    let transport = custom_fetcher(&mock.uri()).transport().clone();
    let source = HttpRangeSource::new(transport, &format!("{}/warcs", mock.uri()));
    let mut materializer = Materializer::new(source);

    let capture = CaptureRecord {
        urlkey: "com,example)/".to_string(),
        timestamp: "20170101000000".to_string(),
        url: "http://example.com/".to_string(),
        status: "200".to_string(),
        digest: Some("AAAA".to_string()),
        mime: Some("text/html".to_string()),
        length: Some(stored_len),
        offset: Some(0),
        filename: Some("crawl/a.warc.gz".to_string()),
        extra: BTreeMap::new(),
    };

    let records = materializer
        .materialize(&capture)
        .expect("Materialization failed");
    assert_eq!(records.len(), 2);
    assert_eq!(
        records[0].header("WARC-Source-URI"),
        Some(format!("{}/warcs/crawl/a.warc.gz", mock.uri()).as_str())
    );

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let info = WarcInfo::for_extraction("TEST", None, "cdxfetch warc example.com");
    let mut writer = WarcWriter::new(dir.path(), "TEST", None, info, 1 << 30, true);
    for rec in &records {
        writer.write_record(rec).expect("Failed to write record");
    }

    let out = dir.path().join("TEST-000000.extracted.warc.gz");
    let mut raw = Vec::new();
    std::fs::File::open(&out)
        .expect("Failed to open output")
        .read_to_end(&mut raw)
        .expect("Failed to read output");
    let mut text = Vec::new();
    flate2::read::MultiGzDecoder::new(raw.as_slice())
        .read_to_end(&mut text)
        .expect("Failed to decompress output");
    let text = String::from_utf8_lossy(&text);
    assert!(text.contains("WARC-Type: warcinfo"));
    assert!(text.contains("WARC-Type: response"));
    assert!(text.contains("WARC-Type: request"));
    assert!(text.contains("hello"));
}
