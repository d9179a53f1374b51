// src/replay/text.rs

//! Attachment reference correction in rich text

use crate::journal::Journal;
use crate::model::WiItem;
use regex::Regex;

/// An uploaded attachment: the file name used in text and its target URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUrl {
    pub file_name: String,
    pub url: String,
}

/// Journaled URLs of attachments added to `item` up to revision `index`
pub fn resolve_attachment_urls(item: &WiItem, index: usize, journal: &Journal) -> Vec<AttachmentUrl> {
    item.attachments_through(index)
        .filter_map(|att| {
            journal
                .is_attachment_migrated(&att.att_origin_id)
                .map(|url| AttachmentUrl {
                    file_name: att.reference_name().to_string(),
                    url: url.to_string(),
                })
        })
        .collect()
}

/// Rewrite `src` and `href` attributes naming an attachment to its target URL
///
/// An attribute matches when its value is the bare file name (raw or
/// percent-encoded) or an attachment download path ending in it. Returns `None`
/// when nothing changed.
pub fn correct_references(html: &str, attachments: &[AttachmentUrl]) -> Option<String> {
    let mut corrected = html.to_string();
    for att in attachments {
        if att.file_name.is_empty() {
            continue;
        }
        let encoded = urlencoding::encode(&att.file_name).into_owned();
        let names = if encoded == att.file_name {
            regex::escape(&att.file_name)
        } else {
            format!("{}|{}", regex::escape(&att.file_name), regex::escape(&encoded))
        };
        let pattern = format!(r#"\b(src|href)="(?:[^"]*/attachments?/[^"]*/)?(?:{names})""#);
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        let replacement = format!(r#"$1="{}""#, att.url.replace('$', "$$"));
        corrected = re.replace_all(&corrected, replacement.as_str()).into_owned();
    }
    (corrected != html).then_some(corrected)
}
