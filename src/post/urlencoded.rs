//! `application/x-www-form-urlencoded` body decoding.
//!
//! Mirrors [`crate::query::Query`]'s `&`/`=` splitting, but percent-decodes
//! and maps `+` to space, which `Query` deliberately doesn't do for its
//! zero-copy URL-parsing use case. A POST body is already a private copy
//! sitting in the connection's parse buffer (or an owned buffer, for
//! chunked bodies), so decoding here doesn't cost an extra allocation that
//! wouldn't otherwise happen.

use super::DecodedField;
use crate::{errors::ErrorKind, limits::PostLimits};
use memchr::memchr;
use percent_encoding::percent_decode;

/// Decodes a `application/x-www-form-urlencoded` body into fields, each
/// complete and terminated (the whole body is available up front, so there's
/// no notion of a field arriving in more than one piece here).
pub(crate) fn decode(body: &[u8], limits: &PostLimits) -> Result<Vec<DecodedField>, ErrorKind> {
    let mut fields = Vec::new();
    let mut start = 0;

    while start < body.len() {
        if fields.len() >= limits.max_fields {
            return Err(ErrorKind::TooManyHeaders);
        }

        let end = memchr(b'&', &body[start..])
            .map(|pos| start + pos)
            .unwrap_or(body.len());

        let index = memchr(b'=', &body[start..end]).unwrap_or(end - start);
        let split_index = start + index;

        let key = &body[start..split_index];
        let value = if split_index < end {
            &body[split_index + 1..end]
        } else {
            b""
        };

        if key.len() > limits.key_size || value.len() > limits.value_size {
            return Err(ErrorKind::BodyTooLarge);
        }

        fields.push(DecodedField {
            key: decode_component(key)?,
            file_name: None,
            content_type: None,
            transfer_encoding: None,
            data: decode_component(value)?.into_bytes(),
            terminated: true,
        });
        start = end + 1;
    }

    Ok(fields)
}

/// Looks up a single field by key without building the full field list, for
/// [`crate::Request::post`].
pub(crate) fn lookup(body: &[u8], key: &[u8]) -> Option<String> {
    let mut start = 0;

    while start < body.len() {
        let end = memchr(b'&', &body[start..])
            .map(|pos| start + pos)
            .unwrap_or(body.len());

        let index = memchr(b'=', &body[start..end]).unwrap_or(end - start);
        let split_index = start + index;

        let raw_key = &body[start..split_index];
        let raw_value = if split_index < end {
            &body[split_index + 1..end]
        } else {
            b""
        };

        if let Ok(decoded_key) = decode_component(raw_key) {
            if decoded_key.as_bytes() == key {
                return decode_component(raw_value).ok();
            }
        }

        start = end + 1;
    }

    None
}

fn decode_component(raw: &[u8]) -> Result<String, ErrorKind> {
    let plus_replaced: Vec<u8> = raw
        .iter()
        .map(|&b| if b == b'+' { b' ' } else { b })
        .collect();

    percent_decode(&plus_replaced)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|_| ErrorKind::InvalidHeader)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> PostLimits {
        PostLimits::default()
    }

    fn values(body: &[u8]) -> Vec<(String, String)> {
        decode(body, &limits())
            .unwrap()
            .into_iter()
            .map(|f| (f.key, String::from_utf8(f.data).unwrap()))
            .collect()
    }

    #[test]
    fn decodes_plain_pairs() {
        assert_eq!(values(b"name=john&age=25"), vec![
            ("name".into(), "john".into()),
            ("age".into(), "25".into()),
        ]);
    }

    #[test]
    fn decodes_percent_and_plus() {
        assert_eq!(values(b"q=hello+world&e=a%40b.com"), vec![
            ("q".into(), "hello world".into()),
            ("e".into(), "a@b.com".into()),
        ]);
    }

    #[test]
    fn key_only_field() {
        assert_eq!(values(b"flag&empty="), vec![
            ("flag".into(), "".into()),
            ("empty".into(), "".into()),
        ]);
    }

    #[test]
    fn rejects_too_many_fields() {
        let mut limits = limits();
        limits.max_fields = 1;
        assert_eq!(
            decode(b"a=1&b=2", &limits).unwrap_err(),
            ErrorKind::TooManyHeaders
        );
    }

    #[test]
    fn all_fields_are_terminated() {
        assert!(decode(b"a=1", &limits()).unwrap().iter().all(|f| f.terminated));
    }

    #[test]
    fn lookup_finds_key() {
        assert_eq!(lookup(b"name=john&age=25", b"age"), Some("25".into()));
    }

    #[test]
    fn lookup_missing_key_is_none() {
        assert_eq!(lookup(b"name=john", b"age"), None);
    }

    #[test]
    fn lookup_decodes_value() {
        assert_eq!(lookup(b"q=hello+world", b"q"), Some("hello world".into()));
    }
}
