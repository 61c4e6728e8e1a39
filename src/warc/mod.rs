//! Turning capture records into WARC records
//!
//! A capture record locates stored content by (filename, offset, length)
//! inside the archive's WARC files. The materializer fetches that byte
//! range through an injected [`RangeSource`], re-parses the stored record,
//! stamps provenance headers, and pairs it with a synthesized request
//! record. Revisit captures whose digest already appeared for the same
//! urlkey in this run become revisit records instead, with no refetch.
//! Failures are localized to the single capture unless the caller asked
//! for fail-fast.

pub mod record;
pub mod writer;

use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

use crate::record::CaptureRecord;
use crate::timeutil::{pad_timestamp, time_to_iso_date, timestamp_to_time};
use crate::transport::Transport;
use crate::{CdxError, Result};

pub use record::WarcRecord;
pub use writer::{WarcInfo, WarcWriter};

/// Reads N bytes at offset O from resource R. The materializer's only view
/// of storage; implementations cover HTTP archives and in-memory fixtures.
pub trait RangeSource {
    fn fetch_range(&self, filename: &str, offset: u64, length: u64) -> Result<Vec<u8>>;

    /// A display location for the resource, used in provenance headers.
    fn locate(&self, filename: &str) -> String;
}

/// Fetches ranges over HTTP from `prefix/filename`.
pub struct HttpRangeSource {
    transport: Arc<Transport>,
    prefix: String,
}

impl HttpRangeSource {
    pub fn new(transport: Arc<Transport>, prefix: &str) -> HttpRangeSource {
        HttpRangeSource {
            transport,
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }
}

impl RangeSource for HttpRangeSource {
    fn fetch_range(&self, filename: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.transport
            .fetch_range(&self.locate(filename), offset, length)
    }

    fn locate(&self, filename: &str) -> String {
        format!("{}/{}", self.prefix, filename)
    }
}

/// In-memory byte source for tests and local runs; no network involved.
#[derive(Default)]
pub struct MemoryRangeSource {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryRangeSource {
    pub fn new() -> MemoryRangeSource {
        MemoryRangeSource::default()
    }

    pub fn insert(&mut self, filename: &str, bytes: Vec<u8>) {
        self.files.insert(filename.to_string(), bytes);
    }
}

impl RangeSource for MemoryRangeSource {
    fn fetch_range(&self, filename: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let bytes = self.files.get(filename).ok_or_else(|| CdxError::Decode {
            url: filename.to_string(),
            message: "no such file in memory source".to_string(),
        })?;
        let start = offset as usize;
        let end = (offset + length) as usize;
        if end > bytes.len() || start > end {
            return Err(CdxError::Decode {
                url: filename.to_string(),
                message: format!("range {}-{} outside file of {} bytes", start, end, bytes.len()),
            });
        }
        Ok(bytes[start..end].to_vec())
    }

    fn locate(&self, filename: &str) -> String {
        format!("memory:{}", filename)
    }
}

/// Materializes capture records into WARC records.
///
/// Per output record the life cycle is pending → fetching bytes → emitted
/// or failed, terminal once written; retries live in the transport under
/// the byte fetch, never here.
pub struct Materializer<S: RangeSource> {
    source: S,
    /// digest → (url, iso date) of the first capture seen with it, keyed
    /// per urlkey for revisit resolution within this run
    seen: HashMap<(String, String), (String, String)>,
}

impl<S: RangeSource> Materializer<S> {
    pub fn new(source: S) -> Materializer<S> {
        Materializer {
            source,
            seen: HashMap::new(),
        }
    }

    /// Produces the WARC records for one capture: response + synthesized
    /// request, or a single revisit record.
    pub fn materialize(&mut self, capture: &CaptureRecord) -> Result<Vec<WarcRecord>> {
        let capture_date = capture_iso_date(capture)?;

        if capture.is_revisit() {
            if let Some(digest) = &capture.digest {
                let key = (capture.urlkey.clone(), digest.clone());
                if let Some((orig_url, orig_date)) = self.seen.get(&key) {
                    tracing::debug!(url = %capture.url, timestamp = %capture.timestamp, "emitting revisit record");
                    return Ok(vec![self.revisit_record(
                        capture,
                        &capture_date,
                        orig_url.clone(),
                        orig_date.clone(),
                    )]);
                }
            }
            // revisit of something outside this run; the stored record is
            // still fetchable and resolves it
            tracing::warn!(url = %capture.url, timestamp = %capture.timestamp, "revisit record being resolved by refetch");
        }

        let (filename, offset, length) = locate_fields(capture)?;
        let bytes = self
            .source
            .fetch_range(&filename, offset, length)
            .map_err(|e| materialization_err(capture, &e.to_string()))?;

        let mut response = WarcRecord::parse(&bytes, &filename)
            .map_err(|e| materialization_err(capture, &e.to_string()))?;
        let source_uri = self.source.locate(&filename);
        if response.header("WARC-Source-URI").is_some() {
            tracing::warn!(url = %capture.url, "stored record already carries WARC-Source-URI");
        }
        response.set_header("WARC-Source-URI", &source_uri);
        response.set_header(
            "WARC-Source-Range",
            &format!("bytes={}-{}", offset, offset + length.saturating_sub(1)),
        );
        if let Some(target) = response.header("WARC-Target-URI") {
            if target != capture.url {
                tracing::warn!(
                    stored = %target,
                    capture = %capture.url,
                    "stored WARC-Target-URI differs from the capture url"
                );
            }
        }
        let response_id = response
            .header("WARC-Record-ID")
            .map(|s| s.to_string())
            .unwrap_or_else(|| record::record_id(&[&capture.url, &capture.timestamp]));
        response.set_header("WARC-Record-ID", &response_id);

        if let Some(digest) = &capture.digest {
            self.seen
                .entry((capture.urlkey.clone(), digest.clone()))
                .or_insert_with(|| (capture.url.clone(), capture_date.clone()));
        }

        let request = self.request_record(capture, &capture_date, &response_id)?;
        Ok(vec![response, request])
    }

    /// Minimal synthesized request record paired with a response.
    fn request_record(
        &self,
        capture: &CaptureRecord,
        capture_date: &str,
        response_id: &str,
    ) -> Result<WarcRecord> {
        let parsed = Url::parse(&capture.url).map_err(|e| materialization_err(capture, &e.to_string()))?;
        let host = parsed.host_str().unwrap_or_default().to_string();
        let mut path = parsed.path().to_string();
        if let Some(q) = parsed.query() {
            path.push('?');
            path.push_str(q);
        }

        let mut request = WarcRecord::new("request");
        request.set_header(
            "WARC-Record-ID",
            &record::record_id(&[&capture.url, &capture.timestamp, "request"]),
        );
        request.set_header("WARC-Date", capture_date);
        request.set_header("WARC-Target-URI", &capture.url);
        request.set_header("WARC-Concurrent-To", response_id);
        request.set_header("Content-Type", "application/http; msgtype=request");
        request.body = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: cdxfetch/{}\r\n\r\n",
            path,
            host,
            env!("CARGO_PKG_VERSION")
        )
        .into_bytes();
        Ok(request)
    }

    /// Revisit record pointing at an earlier capture with the same digest.
    fn revisit_record(
        &self,
        capture: &CaptureRecord,
        capture_date: &str,
        orig_url: String,
        orig_date: String,
    ) -> WarcRecord {
        let mut rec = WarcRecord::new("revisit");
        rec.set_header(
            "WARC-Record-ID",
            &record::record_id(&[&capture.url, &capture.timestamp, "revisit"]),
        );
        rec.set_header("WARC-Date", capture_date);
        rec.set_header("WARC-Target-URI", &capture.url);
        rec.set_header(
            "WARC-Profile",
            "http://netpreserve.org/warc/1.0/revisit/identical-payload-digest",
        );
        rec.set_header("WARC-Refers-To-Target-URI", &orig_url);
        rec.set_header("WARC-Refers-To-Date", &orig_date);
        if let Some(digest) = &capture.digest {
            rec.set_header("WARC-Payload-Digest", &format_digest(digest));
        }
        rec
    }
}

/// Materializes a whole capture stream into a writer, localizing per-record
/// failures unless `fail_fast` is set. Returns (written, skipped).
pub fn materialize_stream<S: RangeSource, I>(
    materializer: &mut Materializer<S>,
    writer: &mut WarcWriter,
    captures: I,
    fail_fast: bool,
) -> Result<(u64, u64)>
where
    I: IntoIterator<Item = Result<CaptureRecord>>,
{
    let mut written = 0u64;
    let mut skipped = 0u64;
    for capture in captures {
        let capture = capture?;
        match materializer.materialize(&capture) {
            Ok(records) => {
                for rec in &records {
                    writer.write_record(rec)?;
                }
                written += 1;
            }
            Err(e) if e.is_per_record() && !fail_fast => {
                tracing::warn!(error = %e, "skipping capture");
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok((written, skipped))
}

fn locate_fields(capture: &CaptureRecord) -> Result<(String, u64, u64)> {
    match (&capture.filename, capture.offset, capture.length) {
        (Some(f), Some(o), Some(l)) => Ok((f.clone(), o, l)),
        _ => Err(materialization_err(
            capture,
            "capture carries no filename/offset/length to fetch",
        )),
    }
}

fn capture_iso_date(capture: &CaptureRecord) -> Result<String> {
    let t = timestamp_to_time(&pad_timestamp(&capture.timestamp))
        .map_err(|e| materialization_err(capture, &e.to_string()))?;
    Ok(time_to_iso_date(t))
}

fn materialization_err(capture: &CaptureRecord, message: &str) -> CdxError {
    CdxError::Materialization {
        url: capture.url.clone(),
        timestamp: capture.timestamp.clone(),
        message: message.to_string(),
    }
}

/// Formats a bare CDX digest as a WARC digest header value. CDX rows carry
/// base32 sha-1 digests without the algorithm tag.
fn format_digest(digest: &str) -> String {
    if digest.contains(':') {
        digest.to_string()
    } else {
        format!("sha1:{}", digest)
    }
}
