//! Version-tag recognition and ordering
//!
//! Release tags are sorted descending so the newest version is indexed
//! first; blob dedup then skips every file an older release left
//! untouched, which is where the bulk of the indexing speedup comes from.

use std::cmp::Ordering;

/// Whether a tag name looks like a release version: an optional leading
/// "v" followed by an ASCII digit.
pub fn is_version_tag(name: &str) -> bool {
    let s = name.strip_prefix('v').unwrap_or(name);
    s.as_bytes().first().is_some_and(|b| b.is_ascii_digit())
}

/// Compare two version strings for descending order (newest first).
pub fn compare_desc(a: &str, b: &str) -> Ordering {
    compare(b, a)
}

/// Compare two version strings: split on "." and "-", compare segments
/// numerically when both parse as integers, lexicographically otherwise.
pub fn compare(a: &str, b: &str) -> Ordering {
    let pa = split(a);
    let pb = split(b);
    for i in 0..pa.len().max(pb.len()) {
        let sa = pa.get(i).copied().unwrap_or("");
        let sb = pb.get(i).copied().unwrap_or("");
        match (sa.parse::<u64>(), sb.parse::<u64>()) {
            (Ok(na), Ok(nb)) => match na.cmp(&nb) {
                Ordering::Equal => continue,
                other => return other,
            },
            _ => match sa.cmp(sb) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
    Ordering::Equal
}

fn split(s: &str) -> Vec<&str> {
    let s = s.strip_prefix('v').unwrap_or(s);
    s.split(['.', '-']).collect()
}
