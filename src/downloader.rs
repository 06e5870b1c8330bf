//! Downloader module.
//!
//! This module contains the ticket downloader, which walks a ticket's
//! metadata, history and attachments through the REST interface and
//! reconstructs them as a navigable directory tree:
//!
//! ```text
//! rt{ticket_id}/
//! ├── metadata.txt
//! ├── history.txt
//! ├── attachments.txt
//! └── {history_id}/
//!     ├── message.txt
//!     ├── n{attachment_id}.{ext}
//!     └── n{attachment_id}.tsv
//! ```
//!
//! The server's long history format (`?format=l`) is broken, so every
//! history item is fetched individually through a follow-up request.

use calamine::{open_workbook, DataType, Reader, Xlsx};
use log::{debug, error, info, warn};
use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    result,
};
use thiserror::Error;

use crate::{
    parser::{
        attachments::{parse_attachment_list, AttachmentMeta},
        history::{self, parse_history_list, parse_history_message, EMPTY_ATTACHMENT_SIZE},
    },
    session::{self, FetchRest},
};

/// The mail header RT stamps on outgoing email it sent itself. A
/// history item whose detailed message carries it is excluded from
/// the archive, attachments included. This is a content-level check,
/// wider than the event-text filter applied to the history listing.
pub const LOOP_PREVENTION_HEADER: &str = "X-RT-Loop-Prevention:";

/// Fallback MIME type for attachments missing from the attachment
/// index.
const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot create ticket directory {1}")]
    CreateTicketDirError(#[source] io::Error, PathBuf),
    #[error("cannot create history item directory {1}")]
    CreateHistoryDirError(#[source] io::Error, PathBuf),
    #[error("cannot write {1}")]
    WriteFileError(#[source] io::Error, PathBuf),
    #[error("cannot fetch {1}")]
    FetchError(#[source] session::Error, String),
    #[error("cannot parse history message {1}")]
    ParseHistoryMessageError(#[source] history::Error, String),
    #[error("cannot open spreadsheet {1}")]
    OpenWorkbookError(#[source] calamine::XlsxError, PathBuf),
    #[error("cannot find a worksheet in {0}")]
    EmptyWorkbookError(PathBuf),
    #[error("cannot read worksheet from {1}")]
    ReadWorksheetError(#[source] calamine::XlsxError, PathBuf),
}

pub type Result<T> = result::Result<T, Error>;

/// Downloads complete ticket data to an organized directory
/// structure. One round-trip at a time: a response is fully consumed
/// and written to disk before the next request is issued.
pub struct TicketDownloader<S: FetchRest> {
    session: S,
}

impl<S: FetchRest> TicketDownloader<S> {
    pub fn new(session: S) -> Self {
        Self { session }
    }

    /// Downloads all relevant content for a ticket into
    /// `target_dir/rt{ticket_id}/`.
    ///
    /// Applies consistent filtering to history items and attachments:
    /// outgoing email is skipped (event text in the listing, loop
    /// prevention header in the detailed message), zero-byte
    /// attachments are skipped, and file extensions come from the
    /// MIME type recorded in the attachment list. A failed individual
    /// fetch is logged and skipped; the remaining independent steps
    /// still run.
    pub fn download_ticket(&self, ticket_id: &str, target_dir: &Path) -> Result<()> {
        let ticket_dir = target_dir.join(format!("rt{}", ticket_id));
        fs::create_dir_all(&ticket_dir)
            .map_err(|err| Error::CreateTicketDirError(err, ticket_dir.clone()))?;

        info!("downloading ticket {} to {:?}", ticket_id, ticket_dir);

        self.download_metadata(ticket_id, &ticket_dir)?;

        let attachment_index = self.download_attachment_list(ticket_id, &ticket_dir)?;

        let history_payload = match self.download_history(ticket_id, &ticket_dir)? {
            Some(payload) => payload,
            None => {
                error!(
                    "failed to get history for ticket {}, skipping remaining downloads",
                    ticket_id
                );
                return Ok(());
            }
        };

        let history_text = String::from_utf8_lossy(&history_payload);
        debug!("downloading individual history items for ticket {}", ticket_id);

        for history_meta in parse_history_list(&history_text) {
            let history_id = history_meta.history_id.as_str();
            let message_payload =
                match self.download_history_item(ticket_id, &ticket_dir, history_id)? {
                    Some(payload) => payload,
                    None => continue,
                };

            let message_text = String::from_utf8_lossy(&message_payload).into_owned();
            let message = parse_history_message(&message_text)
                .map_err(|err| Error::ParseHistoryMessageError(err, history_id.to_owned()))?;

            for attachment in &message.attachments {
                if attachment.size == EMPTY_ATTACHMENT_SIZE {
                    debug!("skipping empty attachment {}", attachment.id);
                    continue;
                }
                let mime_type = match attachment_index.get(&attachment.id) {
                    Some(meta) => meta.mime_type.as_str(),
                    None => {
                        warn!(
                            "attachment {} missing from attachment index, \
                             falling back to {}",
                            attachment.id, FALLBACK_MIME_TYPE
                        );
                        FALLBACK_MIME_TYPE
                    }
                };
                self.download_history_attachment(
                    ticket_id,
                    &ticket_dir,
                    history_id,
                    &attachment.id,
                    mime_type,
                )?;
            }
        }

        info!("completed downloading ticket {}", ticket_id);
        Ok(())
    }

    /// Downloads the ticket metadata to `metadata.txt`.
    fn download_metadata(&self, ticket_id: &str, ticket_dir: &Path) -> Result<()> {
        debug!("downloading metadata for ticket {}", ticket_id);

        let rt_data = self
            .session
            .fetch_rest(&["ticket", ticket_id])
            .map_err(|err| Error::FetchError(err, format!("ticket/{}", ticket_id)))?;

        if !rt_data.is_ok {
            error!(
                "failed to get metadata for ticket {}: {} {}",
                ticket_id, rt_data.status_code, rt_data.status_text
            );
            return Ok(());
        }

        write_file(&ticket_dir.join("metadata.txt"), &rt_data.payload)
    }

    /// Downloads the history listing to `history.txt` and returns the
    /// payload for reuse, or `None` when the fetch failed.
    fn download_history(&self, ticket_id: &str, ticket_dir: &Path) -> Result<Option<Vec<u8>>> {
        debug!("downloading history for ticket {}", ticket_id);

        let rt_data = self
            .session
            .fetch_rest(&["ticket", ticket_id, "history"])
            .map_err(|err| Error::FetchError(err, format!("ticket/{}/history", ticket_id)))?;

        if !rt_data.is_ok {
            error!(
                "failed to get history for ticket {}: {} {}",
                ticket_id, rt_data.status_code, rt_data.status_text
            );
            return Ok(None);
        }

        write_file(&ticket_dir.join("history.txt"), &rt_data.payload)?;
        Ok(Some(rt_data.payload))
    }

    /// Downloads the attachment listing to `attachments.txt` and
    /// returns it parsed, for attachment id to MIME type lookups. A
    /// failed fetch leaves an empty index and no output file.
    fn download_attachment_list(
        &self,
        ticket_id: &str,
        ticket_dir: &Path,
    ) -> Result<HashMap<String, AttachmentMeta>> {
        debug!("downloading attachment list for ticket {}", ticket_id);

        let rt_data = self
            .session
            .fetch_rest(&["ticket", ticket_id, "attachments"])
            .map_err(|err| Error::FetchError(err, format!("ticket/{}/attachments", ticket_id)))?;

        if !rt_data.is_ok {
            error!(
                "failed to get attachment list for ticket {}: {} {}",
                ticket_id, rt_data.status_code, rt_data.status_text
            );
            return Ok(HashMap::new());
        }

        write_file(&ticket_dir.join("attachments.txt"), &rt_data.payload)?;
        Ok(parse_attachment_list(&String::from_utf8_lossy(&rt_data.payload)))
    }

    /// Downloads an individual history item to
    /// `{history_id}/message.txt` and returns the payload. Returns
    /// `None` when the fetch failed or the item is outgoing email, in
    /// which case no directory is created and its attachments must
    /// not be fetched either.
    fn download_history_item(
        &self,
        ticket_id: &str,
        ticket_dir: &Path,
        history_id: &str,
    ) -> Result<Option<Vec<u8>>> {
        debug!(
            "downloading history item {} for ticket {}",
            history_id, ticket_id
        );

        let rt_data = self
            .session
            .fetch_rest(&["ticket", ticket_id, "history", "id", history_id])
            .map_err(|err| {
                Error::FetchError(err, format!("ticket/{}/history/id/{}", ticket_id, history_id))
            })?;

        if !rt_data.is_ok {
            warn!(
                "failed to get history item {} for ticket {}: {} {}",
                history_id, ticket_id, rt_data.status_code, rt_data.status_text
            );
            return Ok(None);
        }

        if String::from_utf8_lossy(&rt_data.payload).contains(LOOP_PREVENTION_HEADER) {
            debug!(
                "skipping history item {}: outgoing email (loop prevention header)",
                history_id
            );
            return Ok(None);
        }

        let history_item_dir = ticket_dir.join(history_id);
        fs::create_dir_all(&history_item_dir)
            .map_err(|err| Error::CreateHistoryDirError(err, history_item_dir.clone()))?;
        write_file(&history_item_dir.join("message.txt"), &rt_data.payload)?;

        Ok(Some(rt_data.payload))
    }

    /// Downloads one attachment to
    /// `{history_id}/n{attachment_id}.{ext}`, converting spreadsheets
    /// to a sibling `.tsv` afterwards. Zero-length payloads produce
    /// no file.
    fn download_history_attachment(
        &self,
        ticket_id: &str,
        ticket_dir: &Path,
        history_id: &str,
        attachment_id: &str,
        mime_type: &str,
    ) -> Result<()> {
        debug!(
            "downloading attachment {} from history {} for ticket {}",
            attachment_id, history_id, ticket_id
        );

        let rt_data = self
            .session
            .fetch_rest(&["ticket", ticket_id, "attachments", attachment_id, "content"])
            .map_err(|err| {
                Error::FetchError(
                    err,
                    format!("ticket/{}/attachments/{}/content", ticket_id, attachment_id),
                )
            })?;

        if !rt_data.is_ok {
            error!(
                "failed to get content for attachment {}: {} {}",
                attachment_id, rt_data.status_code, rt_data.status_text
            );
            return Ok(());
        }

        if rt_data.payload.is_empty() {
            debug!("skipping attachment {}: empty content", attachment_id);
            return Ok(());
        }

        let extension = mime_type_to_extension(mime_type);
        let attachment_file = ticket_dir
            .join(history_id)
            .join(format!("n{}.{}", attachment_id, extension));
        write_file(&attachment_file, &rt_data.payload)?;

        if extension == "xlsx" {
            let tsv_file = attachment_file.with_extension("tsv");
            if let Err(err) = convert_xlsx_to_tsv(&attachment_file, &tsv_file) {
                error!(
                    "failed to convert {:?} to tsv: {}",
                    attachment_file, err
                );
            }
        }

        Ok(())
    }
}

/// Downloads a ticket with a fresh downloader wrapping the given
/// session.
pub fn download_ticket<S: FetchRest>(
    session: S,
    ticket_id: &str,
    target_dir: &Path,
) -> Result<()> {
    TicketDownloader::new(session).download_ticket(ticket_id, target_dir)
}

/// Resolves a MIME type to a file extension. This is a deliberately
/// closed table: the server only returns a small known set of
/// office, document, image and archive types, and everything else is
/// written as `bin`.
pub fn mime_type_to_extension(mime_type: &str) -> &'static str {
    match mime_type.to_lowercase().as_str() {
        "text/plain" => "txt",
        "text/html" => "html",
        "text/csv" => "csv",
        "application/pdf" => "pdf",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "application/vnd.ms-powerpoint" => "ppt",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => "pptx",
        "application/zip" => "zip",
        "application/x-zip-compressed" => "zip",
        "application/gzip" => "gz",
        "application/x-tar" => "tar",
        "application/json" => "json",
        "application/xml" => "xml",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "image/tiff" => "tiff",
        _ => "bin",
    }
}

/// Converts a saved XLSX attachment to tab-separated values: first
/// worksheet, row by row, cell display values joined with tabs and
/// empty cells as empty strings. The output file is only created
/// once the workbook has opened, so a rejected container leaves no
/// `.tsv` behind.
pub fn convert_xlsx_to_tsv(xlsx_path: &Path, tsv_path: &Path) -> Result<()> {
    debug!("converting {:?} to tsv", xlsx_path);

    let mut workbook: Xlsx<_> = open_workbook(xlsx_path)
        .map_err(|err| Error::OpenWorkbookError(err, xlsx_path.to_owned()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| Error::EmptyWorkbookError(xlsx_path.to_owned()))?
        .map_err(|err| Error::ReadWorksheetError(err, xlsx_path.to_owned()))?;

    let file = File::create(tsv_path)
        .map_err(|err| Error::WriteFileError(err, tsv_path.to_owned()))?;
    let mut writer = BufWriter::new(file);

    for row in range.rows() {
        let line = row
            .iter()
            .map(normalize_cell)
            .collect::<Vec<_>>()
            .join("\t");
        writeln!(writer, "{}", line)
            .map_err(|err| Error::WriteFileError(err, tsv_path.to_owned()))?;
    }
    writer
        .flush()
        .map_err(|err| Error::WriteFileError(err, tsv_path.to_owned()))?;

    info!("created {:?}", tsv_path);
    Ok(())
}

fn normalize_cell(cell: &DataType) -> String {
    match cell {
        DataType::Empty => String::new(),
        cell => cell.to_string(),
    }
}

/// Writes a whole buffer, replacing any previous file content.
fn write_file(path: &Path, payload: &[u8]) -> Result<()> {
    fs::write(path, payload).map_err(|err| Error::WriteFileError(err, path.to_owned()))?;
    info!("created {:?}", path);
    Ok(())
}


#[cfg(test)]
mod test_convert_xlsx_to_tsv {
    use super::convert_xlsx_to_tsv;

    #[test]
    fn test_invalid_container_leaves_no_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let xlsx_path = dir.path().join("invalid.xlsx");
        let tsv_path = dir.path().join("invalid.tsv");
        std::fs::write(&xlsx_path, "this is not a spreadsheet").unwrap();

        assert!(convert_xlsx_to_tsv(&xlsx_path, &tsv_path).is_err());
        assert!(!tsv_path.exists());
    }
}
