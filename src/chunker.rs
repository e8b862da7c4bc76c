//! Content-defined chunking for minified lines
//!
//! Lines longer than [`CHUNK_THRESHOLD`] are split into variable-size
//! chunks using a Buzhash rolling hash, so that a small edit only
//! disturbs the chunks around it. Without this, a one-character change in
//! a 500 KB minified JavaScript line would invalidate the whole line and
//! an attacker could hide a payload behind line length.

const WINDOW_SIZE: usize = 32;
const MASK: u64 = 0x3F; // average chunk ~64 bytes
const MIN_CHUNK: usize = 32;
const MAX_CHUNK: usize = 128;

/// Lines at or below this length are hashed whole, never chunked.
pub const CHUNK_THRESHOLD: usize = 512;

/// Byte-to-hash mixing table plus the same values pre-rotated left by the
/// window size, used to remove the byte leaving the window. Generated at
/// compile time from a fixed xorshift64 sequence; the tables are part of
/// the CDDB v2 format and must never change.
const TABLES: ([u64; 256], [u64; 256]) = build_tables();

const fn build_tables() -> ([u64; 256], [u64; 256]) {
    let mut table = [0u64; 256];
    let mut out_table = [0u64; 256];
    let mut x: u64 = 0x123456789abcdef0;
    let mut i = 0;
    while i < 256 {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        table[i] = x;
        out_table[i] = x.rotate_left(WINDOW_SIZE as u32);
        i += 1;
    }
    (table, out_table)
}

/// Split a line into content-defined chunks if it exceeds the threshold.
/// Short lines come back as a single chunk covering the whole input.
pub fn chunk_line(line: &[u8]) -> Vec<&[u8]> {
    if line.len() <= CHUNK_THRESHOLD {
        return vec![line];
    }
    chunks(line).collect()
}

/// Iterator over the content-defined chunks of `data`. Concatenating the
/// yielded slices in order reproduces `data` exactly.
pub fn chunks(data: &[u8]) -> Chunks<'_> {
    Chunks {
        data,
        start: 0,
        pos: 0,
        hash: 0,
    }
}

pub struct Chunks<'a> {
    data: &'a [u8],
    start: usize,
    pos: usize,
    hash: u64,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let (table, out_table) = &TABLES;
        if self.start >= self.data.len() {
            return None;
        }

        while self.pos < self.data.len() {
            let i = self.pos;
            let b = self.data[i];
            self.hash = self.hash.rotate_left(1) ^ table[b as usize];

            let pos_in_chunk = i - self.start;
            if pos_in_chunk >= WINDOW_SIZE {
                self.hash ^= out_table[self.data[i - WINDOW_SIZE] as usize];
            }

            self.pos += 1;

            let chunk_len = pos_in_chunk + 1;
            if chunk_len < MIN_CHUNK {
                continue;
            }
            // Commas are a preferred boundary: most chunks cut from
            // JSON/PHP array lines end on one, which keeps boundaries
            // aligned across edits.
            if chunk_len >= MAX_CHUNK || (self.hash & MASK) == 0 || b == b',' {
                let chunk = &self.data[self.start..=i];
                self.start = i + 1;
                self.hash = 0;
                return Some(chunk);
            }
        }

        // Trailing remainder, possibly shorter than MIN_CHUNK.
        let chunk = &self.data[self.start..];
        self.start = self.data.len();
        Some(chunk)
    }
}
