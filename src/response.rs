//! Response module.
//!
//! This module contains the decoder for the RT wire envelope, the
//! `RT/<version> <code> <text>` banner followed by a blank line that
//! prefixes every REST response body. The format is undocumented and
//! self-describing only through this grammar, so anything that does
//! not match it is reported as a structured error rather than passed
//! through as garbage.

use log::{error, trace};
use regex::bytes::Regex;
use std::result;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Empty response content from {0}")]
    EmptyResponseError(String),
    #[error(
        "Invalid RT response format. Expected 'RT/x.x.x status message' \
         followed by a blank line but got: {1:?} from {0}"
    )]
    InvalidFormatError(String, Vec<u8>),
    #[error("Invalid RT response format. Status code {1:?} from {0} is out of range")]
    InvalidStatusCodeError(String, String),
}

pub type Result<T> = result::Result<T, Error>;

/// Represents an HTTP response at the protocol boundary. An explicit
/// immutable value type so the envelope decoder does not depend on
/// any specific HTTP client's response shape.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RtResponse {
    pub url: String,
    pub status_code: u16,
    pub content: Vec<u8>,
}

/// Represents a decoded RT envelope: the banner fields plus the
/// payload that follows the blank line.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RtResponseData {
    /// Represents the server version from the banner, kept verbatim
    /// (pre-release suffixes like `5.0.1.beta` included).
    pub version: String,
    /// Represents the RT status code from the banner, which is
    /// independent from the HTTP status code.
    pub status_code: u16,
    /// Represents the reason text from the banner.
    pub status_text: String,
    /// Holds iff the banner is exactly `200 Ok`. `200 Success` is not
    /// ok.
    pub is_ok: bool,
    /// Represents the body without the banner and, for attachment
    /// content responses, without the trailing triple-newline
    /// terminator.
    pub payload: Vec<u8>,
}

/// Decodes the RT envelope from a raw response body.
///
/// `is_content_endpoint` must be set by the caller when the
/// originating request targeted an attachment content download: only
/// that flavor of the protocol terminates its payload with a triple
/// newline, which is stripped here. Other endpoints may or may not
/// carry repeated blank lines of their own, so their payload is never
/// touched.
pub fn parse_rt_response(
    response: &RtResponse,
    is_content_endpoint: bool,
) -> Result<RtResponseData> {
    trace!(">> parse rt response from {}", response.url);

    if response.content.is_empty() {
        return Err(Error::EmptyResponseError(response.url.clone()));
    }

    let banner = Regex::new(r"^RT/([0-9A-Za-z.]+)\s+(\d+)\s+([^\r\n]+)\r?\n\r?\n").unwrap();
    let captures = banner.captures(&response.content).ok_or_else(|| {
        let prefix = response.content.iter().take(50).copied().collect();
        Error::InvalidFormatError(response.url.clone(), prefix)
    })?;

    let version = String::from_utf8_lossy(&captures[1]).into_owned();
    let code_text = String::from_utf8_lossy(&captures[2]).into_owned();
    let status_code = code_text
        .parse::<u16>()
        .map_err(|_| Error::InvalidStatusCodeError(response.url.clone(), code_text))?;
    let status_text = String::from_utf8_lossy(&captures[3]).into_owned();

    let header_end = captures.get(0).unwrap().end();
    let mut payload = response.content[header_end..].to_vec();

    if is_content_endpoint {
        match strip_content_terminator(&payload) {
            Some(len) => payload.truncate(len),
            None => error!(
                "Abnormal end of content payload from {}: cannot verify integrity of binary data",
                response.url
            ),
        }
    }

    let is_ok = status_code == 200 && status_text == "Ok";
    trace!("<< parse rt response: {} {}", status_code, status_text);

    Ok(RtResponseData {
        version,
        status_code,
        status_text,
        is_ok,
        payload,
    })
}

/// Returns the payload length without the trailing triple-newline
/// terminator, or `None` when the terminator is absent.
fn strip_content_terminator(payload: &[u8]) -> Option<usize> {
    if payload.ends_with(b"\r\n\r\n\r\n") {
        Some(payload.len() - 6)
    } else if payload.ends_with(b"\n\n\n") {
        Some(payload.len() - 3)
    } else {
        None
    }
}

#[cfg(test)]
mod test_parse_rt_response {
    use super::{parse_rt_response, Error, RtResponse};

    fn response(content: &[u8]) -> RtResponse {
        RtResponse {
            url: "https://rt.example.com/REST/1.0/ticket/123".into(),
            status_code: 200,
            content: content.to_vec(),
        }
    }

    #[test]
    fn test_valid_200_ok_response() {
        let data = parse_rt_response(&response(b"RT/4.4.3 200 Ok\n\nTicket data here"), false)
            .unwrap();

        assert_eq!("4.4.3", data.version);
        assert_eq!(200, data.status_code);
        assert_eq!("Ok", data.status_text);
        assert!(data.is_ok);
        assert_eq!(b"Ticket data here".to_vec(), data.payload);
    }

    #[test]
    fn test_valid_404_response() {
        let data = parse_rt_response(&response(b"RT/5.0.1 404 Not Found\n\nTicket not found"), false)
            .unwrap();

        assert_eq!("5.0.1", data.version);
        assert_eq!(404, data.status_code);
        assert_eq!("Not Found", data.status_text);
        assert!(!data.is_ok);
        assert_eq!(b"Ticket not found".to_vec(), data.payload);
    }

    #[test]
    fn test_valid_500_response() {
        let data = parse_rt_response(
            &response(b"RT/3.8.10 500 Internal Server Error\n\nServer error details"),
            false,
        )
        .unwrap();

        assert_eq!(500, data.status_code);
        assert_eq!("Internal Server Error", data.status_text);
        assert!(!data.is_ok);
    }

    #[test]
    fn test_200_with_different_status_text_is_not_ok() {
        let data =
            parse_rt_response(&response(b"RT/4.4.3 200 Success\n\nTicket data"), false).unwrap();

        assert_eq!(200, data.status_code);
        assert_eq!("Success", data.status_text);
        assert!(!data.is_ok);
    }

    #[test]
    fn test_content_endpoint_strips_trailing_suffix() {
        let data = parse_rt_response(&response(b"RT/4.4.3 200 Ok\n\nAttachment content\n\n\n"), true)
            .unwrap();

        assert_eq!(b"Attachment content".to_vec(), data.payload);
    }

    #[test]
    fn test_content_endpoint_strips_crlf_suffix() {
        let data = parse_rt_response(
            &response(b"RT/4.4.3 200 Ok\n\nAttachment content\r\n\r\n\r\n"),
            true,
        )
        .unwrap();

        assert_eq!(b"Attachment content".to_vec(), data.payload);
    }

    #[test]
    fn test_content_endpoint_missing_suffix_keeps_payload() {
        let data = parse_rt_response(&response(b"RT/4.4.3 200 Ok\n\nAttachment without suffix"), true)
            .unwrap();

        assert_eq!(b"Attachment without suffix".to_vec(), data.payload);
    }

    #[test]
    fn test_non_content_endpoint_keeps_trailing_newlines() {
        let data = parse_rt_response(&response(b"RT/4.4.3 200 Ok\n\nTicket data\n\n\n"), false)
            .unwrap();

        assert_eq!(b"Ticket data\n\n\n".to_vec(), data.payload);
    }

    #[test]
    fn test_empty_payload() {
        let data = parse_rt_response(&response(b"RT/4.4.3 200 Ok\n\n"), false).unwrap();

        assert!(data.is_ok);
        assert!(data.payload.is_empty());
    }

    #[test]
    fn test_multiline_payload() {
        let data = parse_rt_response(&response(b"RT/4.4.3 200 Ok\n\nLine 1\nLine 2\nLine 3"), false)
            .unwrap();

        assert_eq!(b"Line 1\nLine 2\nLine 3".to_vec(), data.payload);
    }

    #[test]
    fn test_crlf_banner() {
        let data = parse_rt_response(&response(b"RT/4.4.3 200 Ok\r\n\r\nTicket data"), false)
            .unwrap();

        assert!(data.is_ok);
        assert_eq!(b"Ticket data".to_vec(), data.payload);
    }

    #[test]
    fn test_empty_response_content() {
        let err = parse_rt_response(&response(b""), false).unwrap_err();

        assert!(matches!(err, Error::EmptyResponseError(_)));
        assert!(err.to_string().contains("Empty response content"));
    }

    #[test]
    fn test_invalid_response_format() {
        let err = parse_rt_response(
            &response(b"<html><body>Not an RT response</body></html>"),
            false,
        )
        .unwrap_err();

        assert!(err.to_string().contains("Invalid RT response format"));
    }

    #[test]
    fn test_malformed_banner_missing_version() {
        let err = parse_rt_response(&response(b"RT/ 200 Ok\n\nData"), false).unwrap_err();

        assert!(err.to_string().contains("Invalid RT response format"));
    }

    #[test]
    fn test_malformed_banner_missing_status_code() {
        let err = parse_rt_response(&response(b"RT/4.4.3 Ok\n\nData"), false).unwrap_err();

        assert!(err.to_string().contains("Invalid RT response format"));
    }

    #[test]
    fn test_malformed_banner_missing_blank_line() {
        let err = parse_rt_response(&response(b"RT/4.4.3 200 Ok\nData"), false).unwrap_err();

        assert!(err.to_string().contains("Invalid RT response format"));
    }

    #[test]
    fn test_version_formats() {
        for (content, version) in [
            (b"RT/1.0 200 Ok\n\nData".as_slice(), "1.0"),
            (b"RT/4.4.3 200 Ok\n\nData".as_slice(), "4.4.3"),
            (b"RT/5.0.1.beta 200 Ok\n\nData".as_slice(), "5.0.1.beta"),
        ] {
            let data = parse_rt_response(&response(content), false).unwrap();
            assert_eq!(version, data.version);
        }
    }
}
