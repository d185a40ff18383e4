//! HTTP authentication: Basic ([RFC 7617](https://tools.ietf.org/html/rfc7617))
//! and Digest ([RFC 7616](https://tools.ietf.org/html/rfc7616)).

pub mod basic;
pub mod digest;

/// Outcome of checking a request's `Authorization` header against a scheme.
pub type AuthResult = Result<(), crate::errors::ErrorKind>;
