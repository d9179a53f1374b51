// src/source/utility.rs

//! Timestamp and rich-text normalization for source revisions

use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// Minimum spacing between consecutive revisions of one item
pub const REVISION_SPACING: Duration = Duration::milliseconds(50);

/// Decorative wrapper the source puts around inline images
static IMAGE_WRAP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<span class="image-wrap"[^>]*>\(?(<img [^>]*>)\)?</span>"#)
        .expect("static pattern")
});

/// Timestamp for the revision following one at `previous`
///
/// The result is strictly later than `previous` by at least the revision
/// spacing, so timestamps are usable as a cross-item sort key.
pub fn next_valid_delta_rev(previous: DateTime<Utc>, candidate: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let floor = previous + REVISION_SPACING;
    match candidate {
        Some(next) if next > floor => next,
        _ => floor,
    }
}

/// Strip decorative markup around embedded references, keeping the inner tag
pub fn replace_html_elements(html: Option<&str>) -> Result<String> {
    let html = html.ok_or_else(|| Error::invalid_argument("html must not be null"))?;
    Ok(IMAGE_WRAP.replace_all(html, "$1").into_owned())
}
