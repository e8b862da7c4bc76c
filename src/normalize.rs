//! Line normalization and hashing
//!
//! Turns raw source lines into stable 64-bit digests that survive
//! whitespace, comment, and release-metadata churn. Long minified lines
//! are routed through the content-defined chunker so that every chunk
//! gets its own digest.

use std::borrow::Cow;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::OnceLock;

use regex::bytes::Regex;
use xxhash_rust::xxh3::xxh3_64;

use crate::chunker::{self, CHUNK_THRESHOLD};

/// Lines shorter than this are never hashed.
pub const MIN_LINE_SIZE: usize = 10;

/// Maximum length of a single input line (10 MiB). A longer line aborts
/// the remainder of that stream's scan.
pub const MAX_LINE_SIZE: usize = 10 * 1024 * 1024;

/// File extensions that are treated as code.
pub const SCAN_EXTS: &[&str] = &["php", "phtml", "js", "htaccess", "sh"];

const SKIP_PREFIXES: &[&[u8]] = &[b"*", b"/*", b"//", b"#"];

/// Cheap guard substring: the release-metadata regex only runs on lines
/// containing this literal, which keeps it off 99%+ of input.
const RX_GUARD: &[u8] = b"'reference' =>";

fn reference_rx() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    RX.get_or_init(|| Regex::new(r"'reference' => '[a-f0-9]{40}',").unwrap())
}

/// XXH3-64 digest of a byte slice. This is the hash the CDDB v2 format
/// stores; changing it requires a format version bump.
#[inline]
pub fn hash(b: &[u8]) -> u64 {
    xxh3_64(b)
}

/// Digest for a path entry, prefixed with "path:" so path hashes and
/// content hashes cannot collide by construction.
pub fn path_hash(p: &str) -> u64 {
    let mut buf = Vec::with_capacity(5 + p.len());
    buf.extend_from_slice(b"path:");
    buf.extend_from_slice(p.as_bytes());
    xxh3_64(&buf)
}

/// Normalize a line of code: trim whitespace, blank out comment lines,
/// and strip per-release commit pins. Returns an empty slice for lines
/// that must not be hashed.
pub fn line(b: &[u8]) -> Cow<'_, [u8]> {
    let b = trim_ascii(b);
    if b.len() < MIN_LINE_SIZE {
        return Cow::Borrowed(b);
    }
    for prefix in SKIP_PREFIXES {
        if b.starts_with(prefix) {
            return Cow::Borrowed(&[]);
        }
    }
    if contains(b, RX_GUARD) {
        return reference_rx().replace_all(b, &b""[..]);
    }
    Cow::Borrowed(b)
}

fn trim_ascii(b: &[u8]) -> &[u8] {
    let start = b.iter().position(|c| !c.is_ascii_whitespace());
    match start {
        None => &[],
        Some(s) => {
            let end = b.iter().rposition(|c| !c.is_ascii_whitespace()).unwrap();
            &b[s..=end]
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Normalize a line, then hash it (chunking if minified). Calls `emit`
/// for each hash produced; `emit` returns true to continue, false to
/// stop. Empty and comment lines produce no calls.
pub fn hash_line(raw: &[u8], mut emit: impl FnMut(u64) -> bool) {
    if raw.len() < MIN_LINE_SIZE {
        return;
    }
    let norm = line(raw);
    if norm.len() < MIN_LINE_SIZE {
        return;
    }
    // Fast path: lines within the chunk threshold (the vast majority)
    // produce a single hash without touching the chunker.
    if norm.len() <= CHUNK_THRESHOLD {
        emit(hash(&norm));
        return;
    }
    for c in chunker::chunks(&norm) {
        if !emit(hash(c)) {
            return;
        }
    }
}

/// Convenience form of [`hash_line`] that collects all hashes.
pub fn line_hashes(raw: &[u8]) -> Vec<u64> {
    let mut out = Vec::new();
    hash_line(raw, |h| {
        out.push(h);
        true
    });
    out
}

/// Split `r` on newlines (at most [`MAX_LINE_SIZE`] per line), hash each
/// line, and call `emit(hash, raw_line)` per hash. Returns the total
/// number of hashes produced.
///
/// A line past the cap ends the scan of this stream: lines hashed before
/// it are kept, the oversized line and everything after it are dropped.
pub fn hash_reader<R: Read>(r: R, mut emit: impl FnMut(u64, &[u8])) -> std::io::Result<usize> {
    let mut reader = BufReader::new(r);
    let mut buf: Vec<u8> = Vec::new();
    let mut total = 0usize;

    loop {
        buf.clear();
        match read_line_capped(&mut reader, &mut buf)? {
            LineRead::Eof | LineRead::Overlong => break,
            LineRead::Line => {}
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        hash_line(&buf, |h| {
            total += 1;
            emit(h, &buf);
            true
        });
    }
    Ok(total)
}

enum LineRead {
    Line,
    Eof,
    Overlong,
}

/// Read one newline-terminated line into `buf`. Reports `Overlong` as
/// soon as the line's content exceeds [`MAX_LINE_SIZE`], without
/// buffering the rest of it.
fn read_line_capped<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<LineRead> {
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(if buf.is_empty() {
                LineRead::Eof
            } else {
                LineRead::Line
            });
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if buf.len() + pos > MAX_LINE_SIZE {
                    reader.consume(pos + 1);
                    return Ok(LineRead::Overlong);
                }
                buf.extend_from_slice(&available[..=pos]);
                reader.consume(pos + 1);
                return Ok(LineRead::Line);
            }
            None => {
                let n = available.len();
                if buf.len() + n > MAX_LINE_SIZE {
                    reader.consume(n);
                    return Ok(LineRead::Overlong);
                }
                buf.extend_from_slice(available);
                reader.consume(n);
            }
        }
    }
}

/// Whether `path` has a recognized code file extension. Dotfiles like
/// `.htaccess` count as their own extension.
pub fn has_valid_ext(path: &str) -> bool {
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    match name.rfind('.') {
        Some(i) => SCAN_EXTS.contains(&&name[i + 1..]),
        None => false,
    }
}

/// Whether the head of a byte buffer (up to 8 KiB, as read by the
/// caller) is valid UTF-8. A multi-byte sequence cut off at the buffer
/// boundary still counts as valid.
pub fn is_valid_utf8_prefix(buf: &[u8]) -> bool {
    match std::str::from_utf8(buf) {
        Ok(_) => true,
        Err(e) => {
            // Valid up to the end except for a trailing partial sequence.
            e.error_len().is_none() && e.valid_up_to() + 4 > buf.len()
        }
    }
}

/// Probe a file's first 8 KiB for UTF-8 validity.
pub fn is_valid_utf8_file(path: &Path) -> bool {
    let mut f = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut buf = [0u8; 8 * 1024];
    let mut filled = 0usize;
    loop {
        match f.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return false,
        }
        if filled == buf.len() {
            break;
        }
    }
    is_valid_utf8_prefix(&buf[..filled])
}
