//! Normalized capture records
//!
//! Whatever shape a CDX service returns its rows in, they normalize into
//! [`CaptureRecord`] before anything else sees them. Field names follow the
//! pywb convention (`status`, `url`, `mime`); wayback-style rows are renamed
//! during normalization.

use std::collections::BTreeMap;

use serde::Serialize;

/// Status value a CDX row carries when there is no HTTP status, e.g. for
/// revisit records.
pub const NO_STATUS: &str = "-";

/// One archived observation of a URL at a point in time.
///
/// `urlkey` + `timestamp` + `digest` are stable identifiers; `urlkey` is the
/// canonical sort key within any single index. `filename`/`offset`/`length`
/// locate the stored content inside the archive's WARC files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureRecord {
    /// SURT-canonicalized sort/dedup key
    pub urlkey: String,
    /// 14-digit UTC timestamp
    pub timestamp: String,
    /// Original URL as captured
    pub url: String,
    /// HTTP status, or `-` for revisit records
    pub status: String,
    /// Content hash, used to detect revisits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    /// Stored record length in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// Byte offset of the stored record inside `filename`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Location of the stored record, relative to the archive's download prefix
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Any further fields the service returned, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl CaptureRecord {
    /// True for revisit records: content identical to an earlier capture,
    /// stored by reference instead of by content.
    pub fn is_revisit(&self) -> bool {
        self.status == NO_STATUS || self.mime.as_deref() == Some("warc/revisit")
    }

    /// Looks a field up by its normalized name, for field-selected output.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "urlkey" => Some(self.urlkey.clone()),
            "timestamp" => Some(self.timestamp.clone()),
            "url" => Some(self.url.clone()),
            "status" => Some(self.status.clone()),
            "digest" => self.digest.clone(),
            "mime" => self.mime.clone(),
            "length" => self.length.map(|n| n.to_string()),
            "offset" => self.offset.map(|n| n.to_string()),
            "filename" => self.filename.clone(),
            other => self.extra.get(other).cloned(),
        }
    }

    /// All fields present on this record, as name/value pairs in a stable
    /// order. Drives `--all-fields` output.
    pub fn all_fields(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for name in [
            "urlkey",
            "timestamp",
            "url",
            "mime",
            "status",
            "digest",
            "length",
            "offset",
            "filename",
        ] {
            if let Some(v) = self.field(name) {
                out.push((name.to_string(), v));
            }
        }
        for (k, v) in &self.extra {
            out.push((k.clone(), v.clone()));
        }
        out
    }
}
