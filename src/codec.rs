//! Frames JSON-RPC messages on top of a byte stream using LSP's `Content-Length` header.

use std::fmt::{self, Display, Formatter};
use std::io::{self, Write};
use std::str::{self, FromStr};

use bytes::{Buf, BytesMut};

#[cfg(feature = "runtime-agnostic")]
use async_codec_lite::{Decoder, Encoder};
#[cfg(feature = "runtime-tokio")]
use tokio_util::codec::{Decoder, Encoder};

use crate::jsonrpc::Message;

const CONTENT_LENGTH: &str = "Content-Length";

/// Errors that can occur when parsing a JSON-RPC frame.
#[derive(Debug)]
pub enum ParseError {
    /// A header line was missing its `:` separator.
    MissingHeaderColon,
    /// The `Content-Length` header was absent from the frame.
    MissingContentLength,
    /// The `Content-Length` header's value could not be parsed as a non-negative integer.
    InvalidContentLength,
    /// An I/O error occurred while reading or writing the underlying stream.
    Io(io::Error),
    /// The frame body could not be parsed as a JSON-RPC message.
    Json(serde_json::Error),
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ParseError::MissingHeaderColon => write!(f, "malformed header: missing `:` separator"),
            ParseError::MissingContentLength => write!(f, "missing `Content-Length` header"),
            ParseError::InvalidContentLength => write!(f, "invalid `Content-Length` value"),
            ParseError::Io(e) => write!(f, "failed to read message: {e}"),
            ParseError::Json(e) => write!(f, "failed to parse message: {e}"),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::Io(e) => Some(e),
            ParseError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ParseError {
    fn from(err: io::Error) -> Self {
        ParseError::Io(err)
    }
}

/// Tokio [`Decoder`]/[`Encoder`] implementing the LSP wire framing.
///
/// Headers are ASCII lines terminated by `\r\n`; a blank `\r\n` line ends the header block and is
/// followed by exactly `Content-Length` bytes of UTF-8 JSON. The decoder is stream-oriented: it
/// buffers partial reads and only consumes a full frame (headers + body) once all of its bytes
/// have arrived, leaving everything else in the buffer untouched for the next call.
#[derive(Clone, Debug, Default)]
pub struct LanguageServerCodec {
    remaining_msg_bytes: usize,
}

impl Encoder<Message> for LanguageServerCodec {
    type Error = ParseError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let msg = serde_json::to_string(&item).map_err(ParseError::Json)?;

        dst.reserve(msg.len() + 32);
        let mut writer = dst.writer();
        write!(writer, "{CONTENT_LENGTH}: {}\r\n\r\n{msg}", msg.len())?;
        Ok(())
    }
}

impl Decoder for LanguageServerCodec {
    type Item = Message;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.remaining_msg_bytes == 0 {
            let Some(header_end) = memchr::memmem::find(src, b"\r\n\r\n") else {
                return Ok(None);
            };

            let content_length = parse_content_length(&src[..header_end])?;

            // Drop the header block; what remains begins the body.
            src.advance(header_end + 4);
            self.remaining_msg_bytes = content_length;
        }

        if src.len() < self.remaining_msg_bytes {
            // Not enough data has arrived yet for the body; wait for more.
            return Ok(None);
        }

        let body = src.split_to(self.remaining_msg_bytes);
        self.remaining_msg_bytes = 0;

        let message = serde_json::from_slice(&body).map_err(ParseError::Json)?;
        Ok(Some(message))
    }
}

/// Parses the `Content-Length` value out of a raw header block (everything before the blank
/// line), using `httparse` for the individual header-line tokenization.
fn parse_content_length(raw_headers: &[u8]) -> Result<usize, ParseError> {
    // `httparse::parse_headers` expects the header block to itself be terminated by a blank
    // line, so re-append the delimiter `decode` already located and stripped out.
    let mut with_terminator = Vec::with_capacity(raw_headers.len() + 4);
    with_terminator.extend_from_slice(raw_headers);
    with_terminator.extend_from_slice(b"\r\n\r\n");

    let mut header_storage = [httparse::EMPTY_HEADER; 8];
    let headers = match httparse::parse_headers(&with_terminator, &mut header_storage) {
        Ok(httparse::Status::Complete((_, headers))) => headers,
        Ok(httparse::Status::Partial) | Err(_) => return Err(ParseError::MissingHeaderColon),
    };

    let content_length = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(CONTENT_LENGTH))
        .ok_or(ParseError::MissingContentLength)?;

    let value =
        str::from_utf8(content_length.value).map_err(|_| ParseError::InvalidContentLength)?;
    usize::from_str(value.trim()).map_err(|_| ParseError::InvalidContentLength)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    const REQUEST: &str = r#"{"jsonrpc":"2.0","method":"initialize","params":{},"id":1}"#;

    fn framed(body: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(
            format!("Content-Length: {}\r\n\r\n{}", body.len(), body).as_bytes(),
        );
        buf
    }

    #[test]
    fn decodes_complete_frame() {
        let mut codec = LanguageServerCodec::default();
        let mut buf = framed(REQUEST);

        let message = codec.decode(&mut buf).unwrap().expect("one message");
        assert!(matches!(message, Message::Request(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_multiple_frames_in_one_buffer() {
        let mut codec = LanguageServerCodec::default();
        let mut buf = framed(REQUEST);
        buf.extend_from_slice(&framed(REQUEST));

        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn yields_none_for_incomplete_header() {
        let mut codec = LanguageServerCodec::default();
        let mut buf = BytesMut::from(&b"Content-Length: 50\r\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn yields_none_for_incomplete_body() {
        let mut codec = LanguageServerCodec::default();
        let body = r#"{"jsonrpc":"2.0""#;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(format!("Content-Length: 50\r\n\r\n{body}").as_bytes());

        assert!(codec.decode(&mut buf).unwrap().is_none());

        let padding = "x".repeat(50 - body.len());
        buf.extend_from_slice(padding.as_bytes());
        // The padding completes the byte count but isn't valid JSON; the error must be a JSON
        // parse error, not another "not enough data" result.
        assert!(matches!(codec.decode(&mut buf), Err(ParseError::Json(_))));
    }

    #[test]
    fn rejects_missing_content_length() {
        let mut codec = LanguageServerCodec::default();
        let mut buf = BytesMut::from(&b"Content-Type: foo\r\n\r\n{}"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ParseError::MissingContentLength)
        ));
    }

    #[test]
    fn rejects_non_numeric_content_length() {
        let mut codec = LanguageServerCodec::default();
        let mut buf = BytesMut::from(&b"Content-Length: abc\r\n\r\n{}"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ParseError::InvalidContentLength)
        ));
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut codec = LanguageServerCodec::default();
        let original: Message = serde_json::from_str(REQUEST).unwrap();
        let mut buf = BytesMut::new();
        codec.encode(original, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().expect("one message");
        let expected: Message = serde_json::from_str(REQUEST).unwrap();
        assert_eq!(
            serde_json::to_value(&decoded).unwrap(),
            serde_json::to_value(&expected).unwrap()
        );
    }
}
