use std::io::{self, BufRead, BufReader, Read, Write};

use log::trace;
use thiserror::Error;

use super::frame;

/// Longest request line a server connection accepts.
pub const MAX_LINE_LENGTH: usize = 512_000;

/// Upper bound of a single response read on the client side.
pub const RESPONSE_BUFFER_SIZE: usize = 32_768;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("line exceeds the {limit} byte limit")]
    LineTooLong { limit: usize },
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

/// Framed reader/writer over one bidirectional stream.
///
/// Reads go through an internal buffer; writes go straight to the stream
/// and are flushed after every frame.
pub struct ProtocolTransport<T: Read + Write> {
    reader: BufReader<T>,
    max_line: usize,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self::with_max_line(stream, MAX_LINE_LENGTH)
    }

    pub fn with_max_line(stream: T, max_line: usize) -> Self {
        Self {
            reader: BufReader::new(stream),
            max_line,
        }
    }

    /// Read the next line with its `\n` or `\r\n` terminator removed.
    ///
    /// A trailing line without terminator is still returned; `Ok(None)`
    /// signals a clean end of stream.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut line = Vec::new();
        // room for the "\r\n" terminator on top of the payload
        let limit = self.max_line as u64 + 2;
        let read = (&mut self.reader).take(limit).read_until(b'\n', &mut line)?;

        if read == 0 {
            return Ok(None);
        }

        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }

        if line.len() > self.max_line {
            return Err(TransportError::LineTooLong {
                limit: self.max_line,
            });
        }

        Ok(Some(line))
    }

    /// Read lines until one decodes as a request.
    ///
    /// Lines too short to be a request are dropped without notice.
    pub fn read_request(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        while let Some(mut line) = self.read_line()? {
            if frame::decode_request(&line).is_none() {
                trace!("skipping malformed request line ({} bytes)", line.len());
                continue;
            }
            line.drain(..frame::REQUEST_PREFIX.len());
            return Ok(Some(line));
        }
        Ok(None)
    }

    pub fn write_response(&mut self, body: &[u8]) -> Result<(), TransportError> {
        let stream = self.reader.get_mut();
        stream.write_all(&frame::encode_response(body))?;
        stream.flush()?;
        Ok(())
    }

    /// Write an already encoded request frame.
    pub fn write_request(&mut self, request: &[u8]) -> Result<(), TransportError> {
        let stream = self.reader.get_mut();
        stream.write_all(request)?;
        stream.flush()?;
        Ok(())
    }

    /// Perform one read of at most [`RESPONSE_BUFFER_SIZE`] bytes.
    ///
    /// End of stream is reported as [`io::ErrorKind::UnexpectedEof`].
    pub fn read_response_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0; RESPONSE_BUFFER_SIZE];
        let read = self.reader.read(&mut buf)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by remote",
            )
            .into());
        }
        buf.truncate(read);
        Ok(buf)
    }
}
