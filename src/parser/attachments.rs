//! Attachment list parser module.
//!
//! This module parses the ticket attachment listing, records shaped
//! like `456: Example.pdf (application/pdf / 21.2k)` separated by
//! commas or newlines, with an optional leading `Attachments:` label.
//! The format has no formal grammar, so parsing is best effort:
//! fragments that do not match are skipped and completeness is never
//! promised.

use log::debug;
use regex::Regex;
use std::collections::HashMap;

/// Represents the metadata of one attachment from the ticket
/// attachment list.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AttachmentMeta {
    /// Represents the file name, or the literal `(Unnamed)` for
    /// unnamed attachments. Normalizing `(Unnamed)` away is left to
    /// the consumers that need it.
    pub name: String,
    /// Represents the MIME type, e.g. `application/pdf`.
    pub mime_type: String,
    /// Represents the human-readable size, e.g. `1.2k` or `610b`.
    pub size_str: String,
}

/// Parses the attachment listing into a map keyed by attachment id.
/// Empty input yields an empty map.
pub fn parse_attachment_list(text: &str) -> HashMap<String, AttachmentMeta> {
    let record = Regex::new(r"(\d+): (.*?) \(([^/]+/[^/\s]+) / ([^\)]+)\)").unwrap();
    let mut index = HashMap::new();

    for captures in record.captures_iter(text) {
        let id = captures[1].to_owned();
        let meta = AttachmentMeta {
            name: captures[2].to_owned(),
            mime_type: captures[3].to_owned(),
            size_str: captures[4].to_owned(),
        };
        debug!("found attachment {}: {} ({})", id, meta.name, meta.mime_type);
        index.insert(id, meta);
    }

    index
}
