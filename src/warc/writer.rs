//! Segment-rotating WARC file writer
//!
//! Output files are named `{prefix}[-{subprefix}]-{NNNNNN}.extracted.warc`
//! (plus `.gz` when compressing) and rotate once they pass the size target.
//! Every segment begins with a warcinfo record describing the extraction;
//! its `isPartOf` field carries the caller's prefix and subprefix for
//! provenance. Records are compressed as individual gzip members so readers
//! can seek to any record without decompressing the whole file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;

use crate::timeutil::{now, time_to_iso_date};
use crate::warc::record::{record_id, WarcRecord};
use crate::Result;

/// Fields of the warcinfo record that opens every segment.
#[derive(Debug, Clone)]
pub struct WarcInfo {
    pub software: String,
    pub is_part_of: String,
    pub description: String,
    pub format: String,
    pub creator: Option<String>,
    pub operator: Option<String>,
}

impl WarcInfo {
    /// Standard fields for an extraction driven by `cmdline`.
    pub fn for_extraction(prefix: &str, subprefix: Option<&str>, cmdline: &str) -> WarcInfo {
        let mut is_part_of = prefix.to_string();
        if let Some(sub) = subprefix {
            is_part_of.push('-');
            is_part_of.push_str(sub);
        }
        WarcInfo {
            software: concat!("cdxfetch/", env!("CARGO_PKG_VERSION")).to_string(),
            is_part_of,
            description: format!("warc extraction generated with: {}", cmdline),
            format: "WARC file version 1.0".to_string(),
            creator: None,
            operator: None,
        }
    }

    fn to_fields(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut push = |k: &str, v: &str| {
            out.extend_from_slice(format!("{}: {}\r\n", k, v).as_bytes());
        };
        push("software", &self.software);
        push("isPartOf", &self.is_part_of);
        push("description", &self.description);
        push("format", &self.format);
        if let Some(creator) = &self.creator {
            push("creator", creator);
        }
        if let Some(operator) = &self.operator {
            push("operator", operator);
        }
        out
    }
}

/// Writes WARC records across rotating segment files.
pub struct WarcWriter {
    dir: PathBuf,
    prefix: String,
    subprefix: Option<String>,
    info: WarcInfo,
    /// Rotate after a segment passes this many bytes
    size_target: u64,
    gzip: bool,
    segment: u32,
    current: Option<(PathBuf, File)>,
}

impl WarcWriter {
    pub fn new(
        dir: &Path,
        prefix: &str,
        subprefix: Option<&str>,
        info: WarcInfo,
        size_target: u64,
        gzip: bool,
    ) -> WarcWriter {
        WarcWriter {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            subprefix: subprefix.map(|s| s.to_string()),
            info,
            size_target,
            gzip,
            segment: 0,
            current: None,
        }
    }

    /// Appends one record, opening a fresh segment (with its warcinfo
    /// record) when needed and rotating afterwards if the segment is full.
    pub fn write_record(&mut self, record: &WarcRecord) -> Result<()> {
        if self.current.is_none() {
            self.start_segment()?;
        }
        self.append(record)?;

        let (_, file) = self.current.as_ref().unwrap_or_else(|| unreachable!());
        if file.metadata()?.len() > self.size_target {
            self.current = None;
            self.segment += 1;
        }
        Ok(())
    }

    /// The segment currently being written, if one is open.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|(p, _)| p.as_path())
    }

    fn append(&mut self, record: &WarcRecord) -> Result<()> {
        let (_, file) = self
            .current
            .as_mut()
            .unwrap_or_else(|| unreachable!("segment opened above"));
        let bytes = record.to_bytes();
        if self.gzip {
            // one gzip member per record, so offsets stay seekable
            let mut enc = GzEncoder::new(&mut *file, flate2::Compression::default());
            enc.write_all(&bytes)?;
            enc.finish()?;
        } else {
            file.write_all(&bytes)?;
        }
        file.flush()?;
        Ok(())
    }

    fn start_segment(&mut self) -> Result<()> {
        let path = self.unique_filename()?;
        tracing::info!(path = %path.display(), "opening new warc file");
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        self.current = Some((path.clone(), file));

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut warcinfo = WarcRecord::new("warcinfo");
        // the filename keeps warcinfo ids distinct across segments
        warcinfo.set_header("WARC-Record-ID", &record_id(&[filename.as_str(), "warcinfo"]));
        warcinfo.set_header("WARC-Date", &time_to_iso_date(now()));
        warcinfo.set_header("WARC-Filename", &filename);
        warcinfo.set_header("Content-Type", "application/warc-fields");
        warcinfo.body = self.info.to_fields();
        self.append(&warcinfo)
    }

    /// Picks the next segment filename that does not already exist.
    fn unique_filename(&mut self) -> Result<PathBuf> {
        loop {
            let mut name = self.prefix.clone();
            if let Some(sub) = &self.subprefix {
                name.push('-');
                name.push_str(sub);
            }
            name.push_str(&format!("-{:06}.extracted.warc", self.segment));
            if self.gzip {
                name.push_str(".gz");
            }
            let path = self.dir.join(name);
            if path.exists() {
                self.segment += 1;
            } else {
                return Ok(path);
            }
        }
    }
}
