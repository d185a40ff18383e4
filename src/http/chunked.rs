//! Decoder for `Transfer-Encoding: chunked` bodies (RFC 7230 §4.1).
//!
//! Runs over a slice already carved out of the connection's parse buffer by
//! [`crate::http::request::Parser`], so chunk-size lines and CRLFs are only
//! ever scanned, never copied; the payload bytes themselves are concatenated
//! once into an owned buffer since chunk framing makes them non-contiguous.

use crate::errors::ErrorKind;
use memchr::memchr;

pub(crate) struct Decoded {
    pub(crate) body: Vec<u8>,
    /// Trailer header lines following the terminating 0-size chunk, in
    /// order, with surrounding whitespace trimmed. Empty when the body
    /// carried no trailer section.
    pub(crate) trailers: Vec<(&'static [u8], &'static [u8])>,
}

/// Decodes `data` as a complete chunked body (including the terminating
/// 0-size chunk and any trailer section), failing closed on truncated input
/// rather than waiting for more bytes: this crate reads a request in a
/// single buffered pass, so a chunked body split across reads is rejected
/// the same way an incomplete Content-Length body already is.
///
/// `data` must come from the connection's long-lived parse buffer (see
/// [`crate::http::request::Parser::get_slice_static`]) so the trailer spans
/// in the returned [`Decoded`] can be handed to the application without a
/// copy.
pub(crate) fn decode(mut data: &'static [u8], max_body: usize) -> Result<Decoded, ErrorKind> {
    let mut body = Vec::new();

    loop {
        let line_end = memchr(b'\n', data).ok_or(ErrorKind::InvalidChunk)?;
        let mut size_line = &data[..line_end];
        if size_line.last() == Some(&b'\r') {
            size_line = &size_line[..size_line.len() - 1];
        }

        let size_str = match memchr(b';', size_line) {
            Some(p) => &size_line[..p],
            None => size_line,
        };
        let size = parse_hex_size(size_str)?;

        data = &data[line_end + 1..];

        if size == 0 {
            return parse_trailers(data).map(|trailers| Decoded { body, trailers });
        }

        let new_len = body.len().saturating_add(size);
        if new_len > max_body {
            return Err(ErrorKind::BodyTooLarge);
        }

        if data.len() < size + 2 || &data[size..size + 2] != b"\r\n" {
            return Err(ErrorKind::InvalidChunk);
        }

        body.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}

fn parse_trailers(mut data: &'static [u8]) -> Result<Vec<(&'static [u8], &'static [u8])>, ErrorKind> {
    let mut trailers = Vec::new();

    loop {
        let end = memchr(b'\n', data).ok_or(ErrorKind::InvalidChunk)?;
        let mut line = &data[..end];
        data = &data[end + 1..];

        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() {
            return Ok(trailers);
        }

        let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;
        trailers.push((trim_ows(&line[..colon]), trim_ows(&line[colon + 1..])));
    }
}

fn trim_ows(mut s: &'static [u8]) -> &'static [u8] {
    while matches!(s.first(), Some(b' ') | Some(b'\t')) {
        s = &s[1..];
    }
    while matches!(s.last(), Some(b' ') | Some(b'\t')) {
        s = &s[..s.len() - 1];
    }
    s
}

fn parse_hex_size(src: &[u8]) -> Result<usize, ErrorKind> {
    if src.is_empty() || src.len() > 16 {
        return Err(ErrorKind::InvalidChunk);
    }

    let mut value: u64 = 0;
    for &b in src {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ErrorKind::InvalidChunk),
        };
        value = value
            .checked_mul(16)
            .and_then(|v| v.checked_add(digit as u64))
            .ok_or(ErrorKind::InvalidChunk)?;
    }

    usize::try_from(value).map_err(|_| ErrorKind::InvalidChunk)
}
