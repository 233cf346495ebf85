//! Segment file naming, discovery, and line encoding.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use weft_core::error::Result;

const PREFIX: &str = "events-";
const PLAIN_SUFFIX: &str = ".log";
const GZIP_SUFFIX: &str = ".log.gz";

/// A segment file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub number: u64,
    pub path: PathBuf,
    pub compressed: bool,
}

/// Directory of one partition.
pub fn partition_dir(base: &Path, partition: usize) -> PathBuf {
    base.join(format!("partition-{}", partition))
}

/// File name for a segment, e.g. `events-000042.log`.
pub fn segment_name(number: u64, compressed: bool) -> String {
    let suffix = if compressed { GZIP_SUFFIX } else { PLAIN_SUFFIX };
    format!("{}{:06}{}", PREFIX, number, suffix)
}

/// Parse a segment file name back into its number and compression flag.
pub fn parse_segment_name(name: &str) -> Option<(u64, bool)> {
    let rest = name.strip_prefix(PREFIX)?;
    let (digits, compressed) = if let Some(d) = rest.strip_suffix(GZIP_SUFFIX) {
        (d, true)
    } else if let Some(d) = rest.strip_suffix(PLAIN_SUFFIX) {
        (d, false)
    } else {
        return None;
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|n| (n, compressed))
}

/// List a partition's segments in filename (= numeric) order.
///
/// A missing directory yields an empty list.
pub async fn list_segments(dir: &Path) -> Result<Vec<SegmentFile>> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };

    let mut segments = Vec::new();
    while let Some(item) = read_dir.next_entry().await? {
        let name = item.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((number, compressed)) = parse_segment_name(name) {
            segments.push(SegmentFile {
                number,
                path: item.path(),
                compressed,
            });
        }
    }
    segments.sort_by(|a, b| a.number.cmp(&b.number).then(a.path.cmp(&b.path)));
    Ok(segments)
}

/// Encode a batch of JSON lines for appending to a segment.
///
/// Compressed segments get one gzip member per batch; concatenated members
/// form a valid multi-member gzip stream.
pub fn encode_batch(lines: &str, compressed: bool) -> Result<Vec<u8>> {
    if !compressed {
        return Ok(lines.as_bytes().to_vec());
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(lines.as_bytes())?;
    Ok(encoder.finish()?)
}

/// Decode a whole segment file's bytes into text.
///
/// A truncated gzip tail (crash mid-write) keeps whatever decoded cleanly.
pub fn decode_segment(bytes: &[u8], compressed: bool) -> String {
    if !compressed {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut decoder = MultiGzDecoder::new(bytes);
    let mut out = Vec::new();
    if let Err(e) = decoder.read_to_end(&mut out) {
        tracing::warn!(error = %e, decoded = out.len(), "Truncated gzip segment, keeping decoded prefix");
    }
    String::from_utf8_lossy(&out).into_owned()
}
