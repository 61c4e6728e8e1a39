//! Minimal WARC record model
//!
//! Enough of the WARC format to parse a stored record fetched by byte range
//! (usually a single gzip member) and to serialize records back out. Header
//! names are matched case-insensitively, as the format requires; the
//! `Content-Length` header is authoritative for the body and is rewritten
//! on serialization.

use std::io::Read;

use flate2::read::MultiGzDecoder;

use crate::{CdxError, Result};

pub const WARC_VERSION: &str = "WARC/1.0";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One WARC record: version line, named headers, body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarcRecord {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WarcRecord {
    /// Starts a record of the given type with an empty body.
    pub fn new(record_type: &str) -> WarcRecord {
        WarcRecord {
            headers: vec![("WARC-Type".to_string(), record_type.to_string())],
            body: Vec::new(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces a header, or appends it if absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        for (k, v) in &mut self.headers {
            if k.eq_ignore_ascii_case(name) {
                *v = value.to_string();
                return;
            }
        }
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn record_type(&self) -> Option<&str> {
        self.header("WARC-Type")
    }

    /// Parses a record from raw bytes, transparently decompressing gzip.
    /// `context` labels errors (a filename or URL).
    pub fn parse(bytes: &[u8], context: &str) -> Result<WarcRecord> {
        let decompressed;
        let raw: &[u8] = if bytes.starts_with(&GZIP_MAGIC) {
            let mut out = Vec::new();
            MultiGzDecoder::new(bytes)
                .read_to_end(&mut out)
                .map_err(|e| decode_err(context, &format!("gzip: {}", e)))?;
            decompressed = out;
            &decompressed
        } else {
            bytes
        };

        let header_end = find_blank_line(raw)
            .ok_or_else(|| decode_err(context, "no end of WARC header block"))?;
        let header_text = std::str::from_utf8(&raw[..header_end])
            .map_err(|_| decode_err(context, "WARC header block is not UTF-8"))?;

        let mut lines = header_text.split("\r\n");
        let version = lines.next().unwrap_or("");
        if !version.starts_with("WARC/") {
            return Err(decode_err(
                context,
                &format!("expected a WARC version line, got {:?}", version),
            ));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| decode_err(context, &format!("malformed header line {:?}", line)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let body_start = header_end + 4;
        let content_length: usize = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(raw.len().saturating_sub(body_start));
        let body_end = (body_start + content_length).min(raw.len());
        let body = raw[body_start..body_end].to_vec();

        Ok(WarcRecord { headers, body })
    }

    /// Serializes the record, rewriting `Content-Length` to match the body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 256);
        out.extend_from_slice(WARC_VERSION.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (k, v) in &self.headers {
            if k.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        // two CRLFs terminate a record
        out.extend_from_slice(b"\r\n\r\n");
        out
    }
}

fn find_blank_line(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

fn decode_err(context: &str, message: &str) -> CdxError {
    CdxError::Decode {
        url: context.to_string(),
        message: message.to_string(),
    }
}

/// Makes a `urn:uuid:` record id from seed material. Purely a function of
/// the seed, so re-materializing the same capture reproduces the same id;
/// callers pick seeds unique per record (url + timestamp + role).
pub fn record_id(seed: &[&str]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for part in seed {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!(
        "urn:uuid:{}-{}-{}-{}-{}",
        &digest[0..8],
        &digest[8..12],
        &digest[12..16],
        &digest[16..20],
        &digest[20..32]
    )
}
