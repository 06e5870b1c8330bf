//! History parser module.
//!
//! This module parses the ticket history listing into an ordered
//! sequence of history items, and individual history messages into a
//! structured record carrying the message content and its attachment
//! sublist.

use log::trace;
use regex::Regex;
use std::result;
use thiserror::Error;

/// The event text RT records for mail the system sent on its own.
/// The filter below is an exact string match, as the upstream server
/// emits it: a substring or prefix test might be more robust against
/// server drift, but exact matching is the observed behavior and is
/// kept.
pub const OUTGOING_EMAIL_EVENT: &str = "Outgoing email recorded by RT_System";

/// The size string RT reports for empty attachments. Attachments
/// carrying it are skipped during download.
pub const EMPTY_ATTACHMENT_SIZE: &str = "0b";

/// The fixed indentation the wire format applies to every
/// continuation line of a message content block.
const CONTENT_INDENT: &str = "         ";

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find required field {0} in history message")]
    MissingFieldError(&'static str),
}

pub type Result<T> = result::Result<T, Error>;

/// Represents one entry of the ticket history listing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HistoryItemMeta {
    /// Represents the history item id.
    pub history_id: String,
    /// Represents the event description, e.g. `Ticket created by
    /// user001`.
    pub history_event: String,
}

/// Parses the history listing into a lazy sequence of items in
/// protocol order, skipping entries that are just outgoing email.
/// Lines not matching `<digits>: <text>` (headers, blanks) are
/// ignored.
pub fn parse_history_list(text: &str) -> impl Iterator<Item = HistoryItemMeta> + '_ {
    let line = Regex::new(r"^(\d+): (.*)$").unwrap();

    text.lines().filter_map(move |l| {
        let captures = line.captures(l)?;
        let item = HistoryItemMeta {
            history_id: captures[1].to_owned(),
            history_event: captures[2].to_owned(),
        };
        if item.history_event == OUTGOING_EMAIL_EVENT {
            None
        } else {
            Some(item)
        }
    })
}

/// Represents one attachment reference inside a history message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Attachment {
    /// Represents the attachment id.
    pub id: String,
    /// Represents the file name or description.
    pub name: String,
    /// Represents the human-readable size, e.g. `1.2k` or `0b`.
    pub size: String,
}

/// Represents a parsed history message. All fields are kept as
/// strings to match the wire format; optional fields are `None` when
/// the corresponding wire field is blank.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HistoryMessage {
    pub id: String,
    pub ticket: String,
    pub time_taken: String,
    /// Represents the wire `Type:` field, e.g. `Create` or
    /// `Correspond`.
    pub kind: String,
    pub field: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub data: Option<String>,
    pub description: String,
    /// Represents the message body between the `Content:` and
    /// `Creator:` markers, dedented; `None` when the message has no
    /// content section.
    pub content: Option<String>,
    pub creator: String,
    pub created: String,
    pub attachments: Vec<Attachment>,
}

/// Parses an individual history message.
///
/// The mandatory wire fields (`id`, `Ticket`, `TimeTaken`, `Type`,
/// `Description`, `Creator`, `Created`) are required: a message
/// lacking one means the server changed its format, which is not
/// locally recoverable. The attachment sublist is captured from every
/// `<digits>: <text> (<text>)` occurrence anywhere in the body, since
/// the detailed-message format does not cleanly delimit its
/// attachments section.
pub fn parse_history_message(text: &str) -> Result<HistoryMessage> {
    trace!(">> parse history message");

    let id = require(text, r"id: (\d+)", "id")?;
    let ticket = require(text, r"Ticket: (\d+)", "Ticket")?;
    let time_taken = require(text, r"TimeTaken: (\d+)", "TimeTaken")?;
    let kind = require(text, r"Type: (\w+)", "Type")?;
    let field = optional(text, r"Field: *(.*)");
    let old_value = optional(text, r"OldValue: *(.*)");
    let new_value = optional(text, r"NewValue: *(.*)");
    let data = optional(text, r"Data: *(.*)");
    let description = require(text, r"Description: (.+)", "Description")?
        .trim()
        .to_owned();
    let content = Regex::new(r"(?s)Content: (.*\n?)Creator:")
        .unwrap()
        .captures(text)
        .map(|captures| {
            let raw = captures.get(1).unwrap().as_str();
            let raw = raw.strip_suffix("\n\n\n").unwrap_or(raw);
            dedent_content(raw)
        });
    let creator = require(text, r"Creator: (.+)", "Creator")?;
    let created = require(text, r"Created: (.+)", "Created")?;

    let mut attachments = Vec::new();
    let attachment = Regex::new(r"(\d+): (.+?) \((.+?)\)").unwrap();
    for captures in attachment.captures_iter(text) {
        attachments.push(Attachment {
            id: captures[1].to_owned(),
            name: captures[2].to_owned(),
            size: captures[3].to_owned(),
        });
    }

    trace!("<< parse history message {}", id);

    Ok(HistoryMessage {
        id,
        ticket,
        time_taken,
        kind,
        field,
        old_value,
        new_value,
        data,
        description,
        content,
        creator,
        created,
        attachments,
    })
}

fn require(text: &str, pattern: &str, name: &'static str) -> Result<String> {
    Regex::new(pattern)
        .unwrap()
        .captures(text)
        .map(|captures| captures[1].to_owned())
        .ok_or(Error::MissingFieldError(name))
}

fn optional(text: &str, pattern: &str) -> Option<String> {
    Regex::new(pattern)
        .unwrap()
        .captures(text)
        .map(|captures| captures[1].trim().to_owned())
        .filter(|value| !value.is_empty())
}

/// Removes the fixed 9-space wire indentation from every continuation
/// line. The first line follows the `Content:` label directly and
/// carries no indentation. Deliberately not a dedent-to-common-prefix:
/// the wire format's indentation is fixed.
fn dedent_content(raw: &str) -> String {
    raw.split('\n')
        .enumerate()
        .map(|(i, line)| {
            if i == 0 {
                line
            } else {
                line.strip_prefix(CONTENT_INDENT).unwrap_or(line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod test_parse_history_list {
    use concat_with::concat_line;

    use super::{parse_history_list, HistoryItemMeta};

    #[test]
    fn test_outgoing_email_is_filtered_out() {
        let items: Vec<_> = parse_history_list(concat_line!(
            "1001: Ticket created by user1",
            "1002: Outgoing email recorded by RT_System",
            "1003: X",
        ))
        .collect();

        assert_eq!(
            vec![
                HistoryItemMeta {
                    history_id: "1001".into(),
                    history_event: "Ticket created by user1".into(),
                },
                HistoryItemMeta {
                    history_id: "1003".into(),
                    history_event: "X".into(),
                },
            ],
            items
        );
    }

    #[test]
    fn test_headers_and_blank_lines_are_ignored() {
        let items: Vec<_> = parse_history_list(concat_line!(
            "# 5/5 (/total)",
            "",
            "1001: Ticket created by user1",
            "1002: Outgoing email recorded by RT_System",
            "1003: Correspondence added by user2",
            "1004: Outgoing email recorded by RT_System",
            "1005: Status changed from new to open by user1",
        ))
        .collect();

        assert_eq!(3, items.len());
        assert_eq!("1001", items[0].history_id);
        assert_eq!("1003", items[1].history_id);
        assert_eq!("1005", items[2].history_id);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(0, parse_history_list("").count());
    }

    #[test]
    fn test_only_outgoing_emails() {
        let items = parse_history_list(concat_line!(
            "# 2/2 (/total)",
            "",
            "1001: Outgoing email recorded by RT_System",
            "1002: Outgoing email recorded by RT_System",
        ));

        assert_eq!(0, items.count());
    }

    #[test]
    fn test_sequence_is_restartable_from_source() {
        let text = "1001: Ticket created by user1\n1003: X";

        assert_eq!(2, parse_history_list(text).count());
        assert_eq!(2, parse_history_list(text).count());
    }
}
