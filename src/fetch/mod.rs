//! One paginated query against one index endpoint
//!
//! Always uses the server's paged output mode; a single giant unpaged
//! response would be impolite to the remote service and wrong for large
//! result sets. The two endpoint kinds signal "past the last page"
//! differently (pywb answers 400, wayback answers an empty body) and encode
//! rows differently (jsonl vs a JSON list of lists with a leading field-name
//! row); both normalize into [`CaptureRecord`] here.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::catalog::{EndpointKind, IndexEndpoint};
use crate::query::{QuerySpec, FIELDS_TO_WAYBACK};
use crate::record::CaptureRecord;
use crate::transport::{FetchMode, Transport};
use crate::{CdxError, Result};

/// Lines per page of the remote services; there is no way to ask the API,
/// so size estimates assume this.
pub const LINES_PER_PAGE: u64 = 3000;

/// Result of fetching one page.
#[derive(Debug)]
pub enum Page {
    Records(Vec<CaptureRecord>),
    /// The endpoint has no further pages
    Done,
}

/// Fetches page `page` of `spec` from one endpoint.
///
/// `server_limit` is the caller's remaining record budget, passed through so
/// the service can stop early; the client-side gate still applies on top.
pub fn fetch_page(
    transport: &Transport,
    endpoint: &IndexEndpoint,
    spec: &QuerySpec,
    page: u64,
    server_limit: Option<u64>,
) -> Result<Page> {
    let mut params = spec.to_params(endpoint.kind)?;
    params.push(("page".to_string(), page.to_string()));
    if let Some(limit) = server_limit {
        params.push(("limit".to_string(), limit.to_string()));
    }

    let resp = transport.fetch(&endpoint.base, &params, FetchMode::Cdx)?;
    decode_page(&endpoint.base, resp.status, &resp.text(), endpoint.kind)
}

/// Asks one endpoint how many pages match, without fetching any.
pub fn fetch_num_pages(
    transport: &Transport,
    endpoint: &IndexEndpoint,
    spec: &QuerySpec,
) -> Result<u64> {
    let mut params = spec.to_params(endpoint.kind)?;
    params.push(("showNumPages".to_string(), "true".to_string()));

    let resp = transport.fetch(&endpoint.base, &params, FetchMode::Cdx)?;
    if resp.status != 200 {
        // no captures at all; not an error for a size estimate
        return Ok(0);
    }
    let text = resp.text();
    let value: Value = serde_json::from_str(text.trim()).map_err(|e| CdxError::Decode {
        url: endpoint.base.clone(),
        message: format!("showNumPages response: {}", e),
    })?;
    match value {
        // pywb returns an object
        Value::Object(map) => Ok(map.get("blocks").and_then(Value::as_u64).unwrap_or(0)),
        // wayback returns a bare integer
        Value::Number(n) => Ok(n.as_u64().unwrap_or(0)),
        other => Err(CdxError::Decode {
            url: endpoint.base.clone(),
            message: format!("surprised by showNumPages value {}", other),
        }),
    }
}

/// Converts a page count into an approximate record count, discounting the
/// partial first and last pages.
pub fn pages_to_samples(pages: u64) -> u64 {
    let adjusted = if pages > 1 {
        pages as f64 - 1.0
    } else if pages == 1 {
        0.5
    } else {
        0.0
    };
    (adjusted * LINES_PER_PAGE as f64) as u64
}

/// Decodes one page body into records, `Done` when the endpoint signals the
/// page number ran off the end.
pub fn decode_page(url: &str, status: u16, text: &str, kind: EndpointKind) -> Result<Page> {
    // pywb: 400 past the last page. wayback: empty body.
    if status == 400 || text.is_empty() {
        return Ok(Page::Done);
    }
    if status == 404 {
        // pywb answers 404 with {"error": "No Captures found ..."} for an
        // empty result; anything else on 404 means a misconfigured endpoint
        if text.starts_with('{') {
            let v: Value = serde_json::from_str(text).unwrap_or(Value::Null);
            if v.get("error").is_some() {
                return Ok(Page::Done);
            }
        }
        return Err(CdxError::Decode {
            url: url.to_string(),
            message: "404 for an API call, is the endpoint configured correctly?".to_string(),
        });
    }

    if text.starts_with('{') {
        return decode_jsonl(url, text);
    }
    if text.starts_with('[') {
        return decode_list_of_lists(url, text, kind);
    }
    Err(CdxError::Decode {
        url: url.to_string(),
        message: format!(
            "cannot decode response, first bytes are {:?}",
            text.chars().take(50).collect::<String>()
        ),
    })
}

/// pywb `output=json` is one JSON object per line.
fn decode_jsonl(url: &str, text: &str) -> Result<Page> {
    let mut records = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let obj: BTreeMap<String, Value> =
            serde_json::from_str(line).map_err(|e| CdxError::Decode {
                url: url.to_string(),
                message: format!("bad jsonl line: {}", e),
            })?;
        let fields = obj
            .into_iter()
            .map(|(k, v)| (k, value_to_string(v)))
            .collect();
        records.push(normalize_row(fields, EndpointKind::Pywb));
    }
    Ok(Page::Records(records))
}

/// wayback `output=json` is a JSON list of lists, first row field names.
fn decode_list_of_lists(url: &str, text: &str, kind: EndpointKind) -> Result<Page> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(text).map_err(|e| CdxError::Decode {
        url: url.to_string(),
        message: format!("bad json page: {}", e),
    })?;
    let mut rows = rows.into_iter();
    let Some(header) = rows.next() else {
        return Ok(Page::Done);
    };
    let names: Vec<String> = header.into_iter().map(value_to_string).collect();

    let mut records = Vec::new();
    for row in rows {
        let fields: Vec<(String, String)> = names
            .iter()
            .cloned()
            .zip(row.into_iter().map(value_to_string))
            .collect();
        records.push(normalize_row(fields, kind));
    }
    Ok(Page::Records(records))
}

/// Builds a [`CaptureRecord`] from wire-name/value pairs, renaming fields to
/// their canonical names per the endpoint's table.
pub fn normalize_row(fields: Vec<(String, String)>, kind: EndpointKind) -> CaptureRecord {
    let mut rec = CaptureRecord {
        urlkey: String::new(),
        timestamp: String::new(),
        url: String::new(),
        status: crate::record::NO_STATUS.to_string(),
        digest: None,
        mime: None,
        length: None,
        offset: None,
        filename: None,
        extra: BTreeMap::new(),
    };
    for (wire_name, value) in fields {
        let name = canonical_field(&wire_name, kind);
        match name.as_str() {
            "urlkey" => rec.urlkey = value,
            "timestamp" => rec.timestamp = value,
            "url" => rec.url = value,
            "status" => rec.status = value,
            "digest" => rec.digest = Some(value),
            "mime" => rec.mime = Some(value),
            "length" => rec.length = value.parse().ok(),
            "offset" => rec.offset = value.parse().ok(),
            "filename" => rec.filename = Some(value),
            _ => {
                rec.extra.insert(name, value);
            }
        }
    }
    rec
}

/// Maps a wire field name back to its canonical (pywb) name.
fn canonical_field(wire: &str, kind: EndpointKind) -> String {
    match kind {
        EndpointKind::Pywb => wire.to_string(),
        EndpointKind::Wayback => FIELDS_TO_WAYBACK
            .iter()
            .find(|(_, w)| *w == wire)
            .map(|(canonical, _)| canonical.to_string())
            .unwrap_or_else(|| wire.to_string()),
    }
}

fn value_to_string(v: Value) -> String {
    match v {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Sorts records by absolute timestamp distance from `closest`, ascending.
/// Used for endpoints without native distance sort.
pub fn sort_by_distance(records: &mut [CaptureRecord], closest: &str) {
    let target = crate::timeutil::timestamp_to_time(closest).unwrap_or(0);
    records.sort_by_key(|r| {
        crate::timeutil::timestamp_to_time(&r.timestamp)
            .map(|t| (t - target).abs())
            .unwrap_or(i64::MAX)
    });
}
