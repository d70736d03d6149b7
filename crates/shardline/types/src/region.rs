//! Region tags
//!
//! Regions are free-form operator labels ("us-east", "EU West", "apac_1").
//! They are compared only after normalization.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A normalized region tag. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Region(String);

impl Region {
    /// Normalize `raw` into a region, or `None` if nothing meaningful remains.
    pub fn parse(raw: &str) -> Option<Self> {
        normalize_region(raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, map whitespace and underscores to `-`, collapse repeats and
/// strip leading/trailing separators.
pub fn normalize_region(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        let mapped = if ch.is_whitespace() || ch == '_' { '-' } else { ch };
        if mapped == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.extend(mapped.to_lowercase());
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}
