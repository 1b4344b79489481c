// src/version.rs

//! Package version ordering
//!
//! Versions are `upstream[-release]`. Strict semver strings compare with
//! `semver`; everything else compares segment by segment, numerically where
//! both segments are numbers.

use std::cmp::Ordering;

/// Compare two package version strings
pub fn compare(a: &str, b: &str) -> Ordering {
    if let (Ok(va), Ok(vb)) = (semver::Version::parse(a), semver::Version::parse(b)) {
        return va.cmp(&vb);
    }

    let (up_a, rel_a) = split_release(a);
    let (up_b, rel_b) = split_release(b);

    compare_segments(up_a, up_b).then_with(|| compare_segments(rel_a, rel_b))
}

/// The upstream part of a version, without the package release
pub fn upstream(version: &str) -> &str {
    split_release(version).0
}

fn split_release(version: &str) -> (&str, &str) {
    match version.rsplit_once('-') {
        Some((upstream, release)) => (upstream, release),
        None => (version, ""),
    }
}

fn compare_segments(a: &str, b: &str) -> Ordering {
    let mut left = a.split(['.', '_', '+', '~']);
    let mut right = b.split(['.', '_', '+', '~']);

    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(x), None) => return if x.is_empty() { Ordering::Equal } else { Ordering::Greater },
            (None, Some(y)) => return if y.is_empty() { Ordering::Equal } else { Ordering::Less },
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
