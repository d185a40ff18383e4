//! `multipart/form-data` body decoding via [`multer`].
//!
//! The body is already fully buffered by the time a handler sees it (this
//! crate reads a request in a single pass), so it's wrapped as a
//! single-chunk stream and handed to `multer` rather than driven
//! incrementally off the socket. Each part is still read chunk-by-chunk off
//! `multer`'s field so that a boundary that never closes leaves behind
//! whatever had already been decoded, instead of discarding it.

use super::DecodedField;
use crate::{errors::ErrorKind, limits::PostLimits};
use bytes::Bytes;

/// Outcome of a multipart decode that didn't fully succeed.
pub(crate) enum MultipartError {
    /// The stream ended before the closing boundary. Carries every field
    /// decoded so far, including the in-progress one (without a terminator).
    Partial(Vec<DecodedField>),
    Malformed(ErrorKind),
}

enum Classification {
    Partial,
    Malformed,
}

/// `multer` 3.x doesn't expose a stable "stream ended early" variant, so
/// truncation is detected by matching on the error's rendered message.
fn classify(err: &multer::Error) -> Classification {
    let text = err.to_string().to_ascii_lowercase();
    if text.contains("incomplete") || text.contains("unexpected end") || text.contains("eof") {
        Classification::Partial
    } else {
        Classification::Malformed
    }
}

pub(crate) async fn decode(
    body: &[u8],
    content_type: &str,
    limits: &PostLimits,
) -> Result<Vec<DecodedField>, MultipartError> {
    let boundary =
        multer::parse_boundary(content_type).map_err(|_| MultipartError::Malformed(ErrorKind::InvalidHeader))?;

    let chunk = Bytes::copy_from_slice(body);
    let stream = futures_util::stream::once(async move { Ok::<_, std::io::Error>(chunk) });
    let mut parser = multer::Multipart::new(stream, boundary);

    let mut fields = Vec::new();

    loop {
        let mut field = match parser.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                return Err(match classify(&err) {
                    Classification::Partial => MultipartError::Partial(fields),
                    Classification::Malformed => MultipartError::Malformed(ErrorKind::InvalidHeader),
                })
            }
        };

        if fields.len() >= limits.max_fields {
            return Err(MultipartError::Malformed(ErrorKind::TooManyHeaders));
        }

        let key = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(|m| m.to_string());
        let transfer_encoding = field
            .headers()
            .get("content-transfer-encoding")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut data = Vec::new();
        let mut terminated = false;
        let mut failure = None;

        loop {
            match field.chunk().await {
                Ok(Some(bytes)) => {
                    if data.len() + bytes.len() > limits.value_size {
                        failure = Some(MultipartError::Malformed(ErrorKind::BodyTooLarge));
                        break;
                    }
                    data.extend_from_slice(&bytes);
                }
                Ok(None) => {
                    terminated = true;
                    break;
                }
                Err(err) => {
                    failure = Some(match classify(&err) {
                        Classification::Partial => MultipartError::Partial(Vec::new()),
                        Classification::Malformed => MultipartError::Malformed(ErrorKind::InvalidHeader),
                    });
                    break;
                }
            }
        }

        fields.push(DecodedField {
            key,
            file_name,
            content_type,
            transfer_encoding,
            data,
            terminated,
        });

        if let Some(failure) = failure {
            return Err(match failure {
                MultipartError::Partial(_) => MultipartError::Partial(fields),
                malformed => malformed,
            });
        }
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field<'a>(fields: &'a [DecodedField], key: &str) -> &'a DecodedField {
        fields.iter().find(|f| f.key == key).unwrap()
    }

    #[tokio::test]
    async fn decodes_simple_part() {
        let body = b"--X-BOUNDARY\r\n\
Content-Disposition: form-data; name=\"field1\"\r\n\r\n\
value1\r\n\
--X-BOUNDARY--\r\n";

        let fields = decode(body, "multipart/form-data; boundary=X-BOUNDARY", &PostLimits::default())
            .await
            .ok()
            .unwrap();

        assert_eq!(fields.len(), 1);
        let f = field(&fields, "field1");
        assert_eq!(f.data, b"value1");
        assert!(f.file_name.is_none());
        assert!(f.terminated);
    }

    #[tokio::test]
    async fn decodes_file_part() {
        let body = b"--X-BOUNDARY\r\n\
Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
hello\r\n\
--X-BOUNDARY--\r\n";

        let fields = decode(body, "multipart/form-data; boundary=X-BOUNDARY", &PostLimits::default())
            .await
            .ok()
            .unwrap();

        assert_eq!(fields.len(), 1);
        let f = &fields[0];
        assert_eq!(f.file_name.as_deref(), Some("a.txt"));
        assert_eq!(f.content_type.as_deref(), Some("text/plain"));
        assert_eq!(f.data, b"hello");
    }

    #[tokio::test]
    async fn rejects_bad_content_type() {
        let err = decode(b"", "not-multipart", &PostLimits::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MultipartError::Malformed(ErrorKind::InvalidHeader)));
    }

    #[tokio::test]
    async fn truncated_body_reports_partial() {
        let body = b"--X-BOUNDARY\r\n\
Content-Disposition: form-data; name=\"field1\"\r\n\r\n\
value1";

        let err = decode(body, "multipart/form-data; boundary=X-BOUNDARY", &PostLimits::default())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, MultipartError::Partial(_)));
    }
}
