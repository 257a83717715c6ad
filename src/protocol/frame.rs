//! Wire framing.
//!
//! Requests are a single text line, `get <body>\r\n`. Responses follow the
//! memcache `VALUE` reply shape:
//!
//! ```text
//! VALUE request 0 <len>\r\n
//! <body>\r\n
//! END\r\n
//! ```
//!
//! The `<len>` field is advisory. Readers locate the body by splitting on
//! `\r\n`, so a body may never contain the delimiter itself.
use thiserror::Error;

pub const REQUEST_PREFIX: &[u8] = b"get ";
pub const DELIMITER: &[u8] = b"\r\n";
pub const RESPONSE_KEY: &str = "request";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame body must not contain a CRLF delimiter")]
    EmbeddedDelimiter,

    #[error("incorrect response from remote: expected at least 2 segments, found {segments}")]
    Malformed { segments: usize },
}

/// Encode `body` as a request line.
pub fn encode_request(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if contains_delimiter(body) {
        return Err(FrameError::EmbeddedDelimiter);
    }

    let mut frame = Vec::with_capacity(REQUEST_PREFIX.len() + body.len() + DELIMITER.len());
    frame.extend_from_slice(REQUEST_PREFIX);
    frame.extend_from_slice(body);
    frame.extend_from_slice(DELIMITER);
    Ok(frame)
}

/// Decode one request line, already stripped of its line terminator.
///
/// Returns `None` for lines too short to carry the prefix. The prefix bytes
/// themselves are dropped without inspection.
pub fn decode_request(line: &[u8]) -> Option<&[u8]> {
    if line.len() < REQUEST_PREFIX.len() {
        return None;
    }
    Some(&line[REQUEST_PREFIX.len()..])
}

pub fn encode_response(body: &[u8]) -> Vec<u8> {
    let header = format!("VALUE {RESPONSE_KEY} 0 {}", body.len());

    let mut frame = Vec::with_capacity(header.len() + body.len() + 12);
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(DELIMITER);
    frame.extend_from_slice(body);
    frame.extend_from_slice(DELIMITER);
    frame.extend_from_slice(b"END");
    frame.extend_from_slice(DELIMITER);
    frame
}

/// Extract the body from a raw response buffer.
///
/// Only the second `\r\n`-separated segment is looked at; neither the header
/// nor the `END` trailer is validated.
pub fn decode_response(raw: &[u8]) -> Result<&[u8], FrameError> {
    let mut segments = split_delimited(raw);
    let _header = segments.next();

    match segments.next() {
        Some(body) => Ok(body),
        None => Err(FrameError::Malformed {
            segments: split_delimited(raw).count(),
        }),
    }
}

pub fn contains_delimiter(body: &[u8]) -> bool {
    body.windows(DELIMITER.len()).any(|w| w == DELIMITER)
}

fn split_delimited(raw: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = Some(raw);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.windows(DELIMITER.len()).position(|w| w == DELIMITER) {
            Some(at) => {
                rest = Some(&current[at + DELIMITER.len()..]);
                Some(&current[..at])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}
