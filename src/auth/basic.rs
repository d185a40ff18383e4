//! HTTP Basic authentication (RFC 7617).

use crate::errors::ErrorKind;
use base64::{engine::general_purpose::STANDARD, Engine};

/// Credentials extracted from an `Authorization: Basic ...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Parses an `Authorization` header value, requiring the `Basic` scheme.
pub fn parse(header_value: &[u8]) -> Result<BasicCredentials, ErrorKind> {
    let value = std::str::from_utf8(header_value).map_err(|_| ErrorKind::AuthMalformed)?;
    let token = value
        .strip_prefix("Basic ")
        .ok_or(ErrorKind::AuthMalformed)?;

    let decoded = STANDARD
        .decode(token.trim())
        .map_err(|_| ErrorKind::AuthMalformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| ErrorKind::AuthMalformed)?;

    // user-id and password may themselves contain ':'; only the first
    // separator is significant (RFC 7617 §2).
    let (username, password) = decoded.split_once(':').ok_or(ErrorKind::AuthMalformed)?;

    Ok(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Builds a `WWW-Authenticate: Basic` challenge value for the given realm.
pub fn challenge(realm: &str) -> String {
    format!("Basic realm=\"{realm}\", charset=\"UTF-8\"")
}

/// Verifies a header's credentials against an expected username/password,
/// comparing in constant time once decoded.
pub fn verify(header_value: &[u8], username: &str, password: &str) -> Result<(), ErrorKind> {
    use subtle::ConstantTimeEq;

    let creds = parse(header_value)?;
    let user_ok = creds.username.as_bytes().ct_eq(username.as_bytes());
    let pass_ok = creds.password.as_bytes().ct_eq(password.as_bytes());

    if (user_ok & pass_ok).into() {
        Ok(())
    } else {
        Err(ErrorKind::AuthWrongCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_header() {
        // "Aladdin:open sesame"
        let header = b"Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==";
        let creds = parse(header).unwrap();
        assert_eq!(creds.username, "Aladdin");
        assert_eq!(creds.password, "open sesame");
    }

    #[test]
    fn rejects_wrong_scheme() {
        assert_eq!(parse(b"Digest foo").unwrap_err(), ErrorKind::AuthMalformed);
    }

    #[test]
    fn rejects_bad_base64() {
        assert_eq!(parse(b"Basic !!!!").unwrap_err(), ErrorKind::AuthMalformed);
    }

    #[test]
    fn verify_matches_and_rejects() {
        let header = b"Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==";
        assert!(verify(header, "Aladdin", "open sesame").is_ok());
        assert_eq!(
            verify(header, "Aladdin", "wrong").unwrap_err(),
            ErrorKind::AuthWrongCredentials
        );
    }
}
