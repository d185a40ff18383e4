//! POST body processing: `application/x-www-form-urlencoded` and
//! `multipart/form-data`.
//!
//! Both encodings decode into the same shape: a list of fields, each
//! delivered to the caller through [`PostProcessor::for_each`] as one or
//! more chunks of at most [`FIELD_CHUNK_SIZE`] bytes, followed by a
//! `size == 0` terminator call once the field's data is complete. This
//! mirrors a true incremental parser's callback contract even though the
//! body is already fully buffered by the time a handler sees it (this crate
//! reads a request in a single pass).

pub mod multipart;
pub mod urlencoded;

use crate::{errors::ErrorKind, limits::PostLimits, Request};

/// Fields are delivered to [`PostProcessor::for_each`] in chunks no larger
/// than this, so a large file upload doesn't show up as a single multi-MiB
/// callback invocation.
pub const FIELD_CHUNK_SIZE: usize = 64 * 1024;

/// One chunk of a decoded POST field.
///
/// `offset` is the running byte position of `data` within this field's
/// value, non-decreasing across calls for the same `(key, file_name)` pair.
/// `size == 0` marks the terminator call for a field (delivered exactly once
/// per completed field; a field truncated by a [`PostError::Partial`] body
/// never receives one).
pub struct PostField<'a> {
    pub key: &'a str,
    pub file_name: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub transfer_encoding: Option<&'a str>,
    pub data: &'a [u8],
    pub offset: usize,
    pub size: usize,
}

/// Failure decoding a POST body.
#[derive(Debug)]
pub enum PostError {
    /// The body ended before it was structurally complete (most often a
    /// multipart boundary that never closed). Everything decoded up to that
    /// point is still available: call [`PostProcessor::for_each`] on it
    /// before treating the request as failed, since the already-received
    /// fields are real. The in-progress field at the point of truncation
    /// never receives its terminator call.
    Partial(PostProcessor),
    /// The body was malformed in a way that isn't just truncation (bad
    /// percent-encoding, an unparseable multipart header, too many fields).
    Malformed(ErrorKind),
}

pub(crate) struct DecodedField {
    key: String,
    file_name: Option<String>,
    content_type: Option<String>,
    transfer_encoding: Option<String>,
    data: Vec<u8>,
    terminated: bool,
}

/// Decoded form fields from a POST body, selected by `content-type`.
pub enum PostProcessor {
    /// `application/x-www-form-urlencoded` fields, percent-decoded.
    UrlEncoded(Vec<DecodedField>),
    /// `multipart/form-data` parts, including file uploads.
    Multipart(Vec<DecodedField>),
}

impl PostProcessor {
    /// Inspects the request's `content-type` header and dispatches to the
    /// matching decoder. Returns `None` if the content type isn't a form
    /// encoding this processor understands (the caller should read the body
    /// itself in that case).
    pub async fn from_request(
        request: &Request,
        limits: &PostLimits,
    ) -> Option<Result<Self, PostError>> {
        let content_type = request.header(b"content-type")?;
        let body = request.body().unwrap_or(&[]);

        if content_type.starts_with(b"application/x-www-form-urlencoded") {
            return Some(
                urlencoded::decode(body, limits)
                    .map(PostProcessor::UrlEncoded)
                    .map_err(PostError::Malformed),
            );
        }

        if content_type.starts_with(b"multipart/form-data") {
            let content_type = std::str::from_utf8(content_type).ok()?;
            return Some(match multipart::decode(body, content_type, limits).await {
                Ok(fields) => Ok(PostProcessor::Multipart(fields)),
                Err(multipart::MultipartError::Partial(fields)) => {
                    Err(PostError::Partial(PostProcessor::Multipart(fields)))
                }
                Err(multipart::MultipartError::Malformed(err)) => Err(PostError::Malformed(err)),
            });
        }

        None
    }

    /// Delivers every decoded field to `f`, see [`PostField`] for the shape
    /// and [`FIELD_CHUNK_SIZE`] for the chunking granularity.
    pub fn for_each<F: FnMut(PostField<'_>)>(&self, mut f: F) {
        let fields = match self {
            PostProcessor::UrlEncoded(fields) | PostProcessor::Multipart(fields) => fields,
        };

        for field in fields {
            let mut offset = 0;
            for chunk in field.data.chunks(FIELD_CHUNK_SIZE) {
                f(PostField {
                    key: &field.key,
                    file_name: field.file_name.as_deref(),
                    content_type: field.content_type.as_deref(),
                    transfer_encoding: field.transfer_encoding.as_deref(),
                    data: chunk,
                    offset,
                    size: chunk.len(),
                });
                offset += chunk.len();
            }

            if field.terminated {
                f(PostField {
                    key: &field.key,
                    file_name: field.file_name.as_deref(),
                    content_type: field.content_type.as_deref(),
                    transfer_encoding: field.transfer_encoding.as_deref(),
                    data: &[],
                    offset,
                    size: 0,
                });
            }
        }
    }
}
