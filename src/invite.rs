//! Invitation issue/redeem and the join exchange (§4.J).
//!
//! Follows the donor's `InvitePayload::new`/`encode`/`decode` shape
//! (struct + base64url envelope + `chrono` expiry) almost exactly,
//! adapted to the spec's cookie format (§4.C: 16 random bytes + 2-byte
//! hash prefix) and one-time, persisted-redemption semantics rather
//! than the donor's reusable, non-persisted in-memory invite.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};
use crate::identity::DeviceClass;
use crate::store::SocketAddrRecord;
use crate::wire::invite::{make_cookie, InvitationUrl};

/// Default invitation lifetime: one week (§4.J).
pub const DEFAULT_INVITATION_TTL: chrono::Duration = chrono::Duration::weeks(1);

/// A seed edge handed to the invitee so it has at least one node to try
/// dialing once it joins (§4.J: "the seed edge set").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedEdge {
    pub name: String,
    pub ed25519_public_hex: String,
    pub device_class: DeviceClass,
    pub addresses: Vec<SocketAddrRecord>,
}

/// Persisted invitation record under `invitations/<cookie>` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInvitation {
    pub invitee_name: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub redeemed: bool,
}

fn invitations_dir(confbase: &Path) -> PathBuf {
    confbase.join("current").join("invitations")
}

fn invitation_path(confbase: &Path, cookie: &str) -> PathBuf {
    invitations_dir(confbase).join(cookie)
}

/// Issues a fresh invitation for `invitee_name`, persists it, and
/// returns the URL to hand out-of-band to the invitee (§4.J). A
/// repeated invite for the same name overwrites any previous pending
/// invitation for that name, per §4.J.
pub fn issue(
    confbase: &Path,
    host: &str,
    port: Option<u16>,
    invitee_name: &str,
    ttl: Option<chrono::Duration>,
) -> Result<String> {
    crate::identity::validate_name(invitee_name)?;

    let dir = invitations_dir(confbase);
    std::fs::create_dir_all(&dir)?;

    // Overwrite any previous pending invite for this name (§4.J).
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if let Ok(data) = std::fs::read_to_string(entry.path()) {
            if let Ok(existing) = serde_json::from_str::<PendingInvitation>(&data) {
                if existing.invitee_name == invitee_name && !existing.redeemed {
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
    }

    let cookie_bytes = make_cookie();
    let now = Utc::now();
    let record = PendingInvitation {
        invitee_name: invitee_name.to_string(),
        issued_at: now,
        expires_at: now + ttl.unwrap_or(DEFAULT_INVITATION_TTL),
        redeemed: false,
    };
    let url = InvitationUrl::new(host, port, cookie_bytes);
    let data = serde_json::to_string_pretty(&record)?;
    std::fs::write(invitation_path(confbase, &url.cookie), data)?;

    Ok(url.to_url())
}

/// Looks up and validates a cookie on the issuer side (run by whatever
/// accepts the invitee's join connection). Returns the invitee's
/// assigned name. Consumes (marks redeemed) the invitation on success.
///
/// Failures: `UNAUTHORIZED` if the cookie is unknown or expired,
/// `BUSY` if it was already redeemed (§4.J).
pub fn redeem(confbase: &Path, cookie: &str) -> Result<String> {
    let path = invitation_path(confbase, cookie);
    let data = std::fs::read_to_string(&path)
        .map_err(|_| MeshError::unauthorized("invitation cookie unknown"))?;
    let mut record: PendingInvitation = serde_json::from_str(&data)?;

    if record.redeemed {
        return Err(MeshError::busy("invitation cookie already redeemed"));
    }
    if Utc::now() > record.expires_at {
        return Err(MeshError::unauthorized("invitation has expired"));
    }

    record.redeemed = true;
    std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
    Ok(record.invitee_name)
}

/// The bundle the issuer signs and sends back to a successfully
/// authenticated invitee (§4.J): its own public key, the invitee's
/// assigned name, and the seed edge set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinBundle {
    pub issuer_name: String,
    pub issuer_ed25519_public_hex: String,
    pub invitee_name: String,
    pub seed_edges: Vec<SeedEdge>,
}

impl JoinBundle {
    /// Writes this bundle into a fresh config directory for the
    /// invitee: one host file per seed node plus the invitee's own
    /// `meshlink.conf` identity (already generated by the caller before
    /// the join exchange began).
    pub fn write_into(&self, confbase: &Path) -> Result<()> {
        let hosts = confbase.join("current").join("hosts");
        std::fs::create_dir_all(&hosts)?;

        let issuer_pub_bytes: [u8; 32] = hex::decode(&self.issuer_ed25519_public_hex)
            .map_err(|e| MeshError::inval(format!("bad issuer public key hex: {e}")))?
            .try_into()
            .map_err(|_| MeshError::inval("issuer public key wrong length"))?;
        let issuer_pub = VerifyingKey::from_bytes(&issuer_pub_bytes)
            .map_err(|e| MeshError::inval(format!("bad issuer public key: {e}")))?;
        let mut issuer_node = crate::store::Node::new(
            self.issuer_name.clone(),
            issuer_pub,
            DeviceClass::Unknown,
        );
        issuer_node.canonical_addresses = Vec::new();
        crate::store::save_node(&hosts, &issuer_node, crate::store::StoragePolicy::Enabled)?;

        for seed in &self.seed_edges {
            let pub_bytes: [u8; 32] = hex::decode(&seed.ed25519_public_hex)
                .map_err(|e| MeshError::inval(format!("bad seed public key hex: {e}")))?
                .try_into()
                .map_err(|_| MeshError::inval("seed public key wrong length"))?;
            let pub_key = VerifyingKey::from_bytes(&pub_bytes)
                .map_err(|e| MeshError::inval(format!("bad seed public key: {e}")))?;
            let mut node = crate::store::Node::new(seed.name.clone(), pub_key, seed.device_class);
            node.canonical_addresses = seed.addresses.clone();
            crate::store::save_node(&hosts, &node, crate::store::StoragePolicy::Enabled)?;
        }
        Ok(())
    }
}

/// Parses and validates an invitation URL before attempting to connect
/// (§4.J: `INVALID_URL` on malformed input).
pub fn parse_invitation_url(url: &str) -> Result<InvitationUrl> {
    InvitationUrl::parse(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningIdentity;

    #[test]
    fn issue_and_redeem_once() {
        let dir = tempfile::tempdir().unwrap();
        let url = issue(dir.path(), "198.51.100.1", Some(655), "newnode", None).unwrap();
        let parsed = parse_invitation_url(&url).unwrap();
        let invitee = redeem(dir.path(), &parsed.cookie).unwrap();
        assert_eq!(invitee, "newnode");
    }

    #[test]
    fn redeeming_twice_fails_busy() {
        let dir = tempfile::tempdir().unwrap();
        let url = issue(dir.path(), "198.51.100.1", None, "newnode", None).unwrap();
        let parsed = parse_invitation_url(&url).unwrap();
        redeem(dir.path(), &parsed.cookie).unwrap();
        let err = redeem(dir.path(), &parsed.cookie).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Busy);
    }

    #[test]
    fn unknown_cookie_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let err = redeem(dir.path(), "does-not-exist").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unauthorized);
    }

    #[test]
    fn expired_invitation_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let url = issue(
            dir.path(),
            "198.51.100.1",
            None,
            "newnode",
            Some(chrono::Duration::seconds(-1)),
        )
        .unwrap();
        let parsed = parse_invitation_url(&url).unwrap();
        let err = redeem(dir.path(), &parsed.cookie).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unauthorized);
    }

    #[test]
    fn repeated_invite_overwrites_previous() {
        let dir = tempfile::tempdir().unwrap();
        let first = issue(dir.path(), "198.51.100.1", None, "dupe", None).unwrap();
        let second = issue(dir.path(), "198.51.100.1", None, "dupe", None).unwrap();
        let first_parsed = parse_invitation_url(&first).unwrap();
        assert!(redeem(dir.path(), &first_parsed.cookie).is_err());
        let second_parsed = parse_invitation_url(&second).unwrap();
        assert_eq!(redeem(dir.path(), &second_parsed.cookie).unwrap(), "dupe");
    }

    #[test]
    fn join_bundle_writes_seed_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let issuer_id = SigningIdentity::generate();
        let seed_id = SigningIdentity::generate();
        let bundle = JoinBundle {
            issuer_name: "issuer".into(),
            issuer_ed25519_public_hex: hex::encode(issuer_id.verifying_key().to_bytes()),
            invitee_name: "newnode".into(),
            seed_edges: vec![SeedEdge {
                name: "seed1".into(),
                ed25519_public_hex: hex::encode(seed_id.verifying_key().to_bytes()),
                device_class: DeviceClass::Backbone,
                addresses: vec![SocketAddrRecord {
                    host: "198.51.100.2".into(),
                    port: 655,
                }],
            }],
        };
        bundle.write_into(dir.path()).unwrap();
        let hosts = dir.path().join("current").join("hosts");
        assert!(hosts.join("issuer").exists());
        let loaded = crate::store::load_node(&hosts, "seed1").unwrap();
        assert_eq!(loaded.canonical_addresses.len(), 1);
    }
}
