//! Invitation URL format (§4.C): `meshlink://<host>[:<port>]/<cookie>`,
//! where `<cookie>` is base64url of 18 bytes (16 random + 2-byte hash
//! prefix). Shaped after the donor's `InvitePayload::encode`/`decode`
//! base64url idiom, but carrying a URL rather than an opaque JSON blob.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::{MeshError, Result};

pub const COOKIE_RANDOM_LEN: usize = 16;
pub const COOKIE_HASH_LEN: usize = 2;
pub const COOKIE_LEN: usize = COOKIE_RANDOM_LEN + COOKIE_HASH_LEN;

/// Builds an 18-byte cookie: 16 random bytes plus a 2-byte SHA-256
/// prefix, used as a cheap integrity check on URLs copy-pasted by hand.
pub fn make_cookie() -> [u8; COOKIE_LEN] {
    let random: [u8; COOKIE_RANDOM_LEN] = crate::crypto::random_array();
    let hash = Sha256::digest(random);
    let mut cookie = [0u8; COOKIE_LEN];
    cookie[..COOKIE_RANDOM_LEN].copy_from_slice(&random);
    cookie[COOKIE_RANDOM_LEN..].copy_from_slice(&hash[..COOKIE_HASH_LEN]);
    cookie
}

pub fn cookie_to_string(cookie: &[u8; COOKIE_LEN]) -> String {
    URL_SAFE_NO_PAD.encode(cookie)
}

fn verify_cookie_checksum(cookie: &[u8]) -> Result<()> {
    if cookie.len() != COOKIE_LEN {
        return Err(MeshError::inval("invitation cookie has wrong length"));
    }
    let hash = Sha256::digest(&cookie[..COOKIE_RANDOM_LEN]);
    if hash[..COOKIE_HASH_LEN] != cookie[COOKIE_RANDOM_LEN..] {
        return Err(MeshError::inval("invitation cookie checksum mismatch"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitationUrl {
    pub host: String,
    pub port: Option<u16>,
    pub cookie: String,
}

impl InvitationUrl {
    pub fn new(host: &str, port: Option<u16>, cookie: [u8; COOKIE_LEN]) -> Self {
        Self {
            host: host.to_string(),
            port,
            cookie: cookie_to_string(&cookie),
        }
    }

    pub fn to_url(&self) -> String {
        match self.port {
            Some(port) => format!("meshlink://{}:{}/{}", self.host, port, self.cookie),
            None => format!("meshlink://{}/{}", self.host, self.cookie),
        }
    }

    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("meshlink://")
            .ok_or_else(|| MeshError::inval("invitation URL missing meshlink:// scheme"))?;
        let (authority, cookie) = rest
            .split_once('/')
            .ok_or_else(|| MeshError::inval("invitation URL missing cookie path"))?;
        if cookie.is_empty() {
            return Err(MeshError::inval("invitation URL has empty cookie"));
        }
        let cookie_bytes = URL_SAFE_NO_PAD
            .decode(cookie)
            .map_err(|e| MeshError::inval(format!("invitation cookie not base64url: {e}")))?;
        verify_cookie_checksum(&cookie_bytes)?;

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (
                h.to_string(),
                Some(
                    p.parse::<u16>()
                        .map_err(|_| MeshError::inval("invitation URL port not a u16"))?,
                ),
            ),
            None => (authority.to_string(), None),
        };

        Ok(Self {
            host,
            port,
            cookie: cookie.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_port() {
        let cookie = make_cookie();
        let url = InvitationUrl::new("198.51.100.4", Some(8655), cookie).to_url();
        let parsed = InvitationUrl::parse(&url).unwrap();
        assert_eq!(parsed.host, "198.51.100.4");
        assert_eq!(parsed.port, Some(8655));
        assert_eq!(parsed.cookie, cookie_to_string(&cookie));
    }

    #[test]
    fn roundtrip_without_port() {
        let cookie = make_cookie();
        let url = InvitationUrl::new("mesh.example", None, cookie).to_url();
        let parsed = InvitationUrl::parse(&url).unwrap();
        assert_eq!(parsed.port, None);
    }

    #[test]
    fn rejects_bad_scheme() {
        assert!(InvitationUrl::parse("http://example/abc").is_err());
    }

    #[test]
    fn rejects_tampered_cookie() {
        let cookie = make_cookie();
        let mut url = InvitationUrl::new("10.0.0.1", Some(655), cookie).to_url();
        url.push('x');
        assert!(InvitationUrl::parse(&url).is_err());
    }
}
