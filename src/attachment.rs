//! Inline image extraction from rendered rich-text bodies.
//!
//! Image references travel as `<img src='URL' title='NAME' longdesc='SIZE##THUMB'/>`
//! tags inside the XHTML-IM body. Extraction is a pure function over the
//! rendered body so it stays independent of the stanza decoder.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::Attachment;

/// Capture groups: image URL, filename, thumbnail size, thumbnail URL.
static IMAGE_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"<img src='([^']+)' title='([^']+)' longdesc='([^']+)##([^']+)'").ok()
});

/// Extract every image attachment from a rendered rich-text body, in document order.
pub fn extract_attachments(html_body: &str) -> Vec<Attachment> {
    let Some(pattern) = IMAGE_TAG.as_ref() else {
        return Vec::new();
    };
    if html_body.is_empty() {
        return Vec::new();
    }

    pattern
        .captures_iter(html_body)
        .map(|caps| Attachment {
            image_url: caps[1].to_string(),
            image_filename: caps[2].to_string(),
            thumbnail_size: caps[3].to_string(),
            thumbnail_url: caps[4].to_string(),
        })
        .collect()
}
