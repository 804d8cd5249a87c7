//! Local node identity: name, signing key, static ECDH key, device class.
//!
//! Grounded on the donor's `MeshIdentity` (load_or_create / save_to_disk /
//! load_from_disk / Drop-zeroize), narrowed to the keys this design
//! actually needs (Ed25519 signing + X25519 static ECDH, no Noise
//! keypair, no ML-KEM material) and extended with the device class the
//! scheduler and routing weight tables need.

use std::path::Path;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::crypto::{SigningIdentity, StaticEcdhKey};
use crate::error::{MeshError, Result};

/// Policy hint influencing autoconnect targets and routing edge weight.
/// Ordered so that `BACKBONE < STATIONARY < PORTABLE < UNKNOWN` holds
/// numerically, which `routing.rs` relies on directly for edge weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Backbone = 0,
    Stationary = 1,
    Portable = 2,
    Unknown = 3,
}

impl DeviceClass {
    /// Minimum number of meta-connections autoconnect tries to maintain
    /// for a node of this class (§4.I).
    pub fn target_connections(self) -> usize {
        match self {
            DeviceClass::Backbone => 3,
            DeviceClass::Stationary => 2,
            DeviceClass::Portable => 1,
            DeviceClass::Unknown => 1,
        }
    }
}

/// Printable-ASCII node name, `[a-zA-Z0-9_-]+`, length <= 32 (§3).
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 32 {
        return Err(MeshError::inval("node name must be 1..=32 bytes"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(MeshError::inval("node name must match [a-zA-Z0-9_-]+"));
    }
    Ok(())
}

/// On-disk identity document: the public parts of an identity plus the
/// signing/ECDH private key bytes when `storage policy != KEYS stripped`.
#[derive(Debug, Serialize, Deserialize)]
struct IdentityDisk {
    name: String,
    device_class: DeviceClass,
    ed25519_private: String,
    x25519_private: String,
}

/// The local mesh's private identity: the only node whose private keys
/// this process holds.
pub struct LocalIdentity {
    pub name: String,
    pub device_class: DeviceClass,
    signing: SigningIdentity,
    ecdh: StaticEcdhKey,
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("name", &self.name)
            .field("device_class", &self.device_class)
            .finish_non_exhaustive()
    }
}

impl LocalIdentity {
    pub fn generate(name: &str, device_class: DeviceClass) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            device_class,
            signing: SigningIdentity::generate(),
            ecdh: StaticEcdhKey::generate(),
        })
    }

    pub fn ed25519_public(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn x25519_public(&self) -> X25519PublicKey {
        self.ecdh.public()
    }

    pub fn signing(&self) -> &SigningIdentity {
        &self.signing
    }

    pub fn ecdh(&self) -> &StaticEcdhKey {
        &self.ecdh
    }

    /// Loads `meshlink.conf` from `confbase/current`, or generates and
    /// persists a fresh identity if none exists yet — mirrors the
    /// donor's `load_or_create`.
    pub fn load_or_create(dir: &Path, name: &str, device_class: DeviceClass) -> Result<Self> {
        let path = dir.join("meshlink.conf");
        if path.exists() {
            Self::load_from_disk(&path)
        } else {
            let identity = Self::generate(name, device_class)?;
            identity.save_to_disk(&path)?;
            Ok(identity)
        }
    }

    pub fn save_to_disk(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let doc = IdentityDisk {
            name: self.name.clone(),
            device_class: self.device_class,
            ed25519_private: hex::encode(self.signing.to_bytes()),
            x25519_private: hex::encode(self.ecdh.to_bytes()),
        };
        let data = serde_json::to_string_pretty(&doc)?;
        std::fs::write(path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn load_from_disk(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let doc: IdentityDisk = serde_json::from_str(&data)?;
        let ed_bytes: [u8; 32] = hex::decode(&doc.ed25519_private)
            .map_err(|e| MeshError::storage(format!("bad ed25519 key hex: {e}")))?
            .try_into()
            .map_err(|_| MeshError::storage("ed25519 key wrong length"))?;
        let x_bytes: [u8; 32] = hex::decode(&doc.x25519_private)
            .map_err(|e| MeshError::storage(format!("bad x25519 key hex: {e}")))?
            .try_into()
            .map_err(|_| MeshError::storage("x25519 key wrong length"))?;
        Ok(Self {
            name: doc.name,
            device_class: doc.device_class,
            signing: crate::crypto::SigningIdentity::from_bytes(ed_bytes),
            ecdh: StaticEcdhKey::from_bytes(x_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(33)).is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("valid-name_1").is_ok());
    }

    #[test]
    fn device_class_ordering_matches_weight_policy() {
        assert!(DeviceClass::Backbone < DeviceClass::Stationary);
        assert!(DeviceClass::Stationary < DeviceClass::Portable);
        assert!(DeviceClass::Portable < DeviceClass::Unknown);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshlink.conf");
        let id = LocalIdentity::generate("foo", DeviceClass::Stationary).unwrap();
        id.save_to_disk(&path).unwrap();
        let loaded = LocalIdentity::load_from_disk(&path).unwrap();
        assert_eq!(loaded.name, "foo");
        assert_eq!(loaded.ed25519_public(), id.ed25519_public());
        assert_eq!(
            loaded.x25519_public().as_bytes(),
            id.x25519_public().as_bytes()
        );
    }

    #[test]
    fn load_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let a = LocalIdentity::load_or_create(dir.path(), "bar", DeviceClass::Portable).unwrap();
        let b = LocalIdentity::load_or_create(dir.path(), "bar", DeviceClass::Portable).unwrap();
        assert_eq!(a.ed25519_public(), b.ed25519_public());
    }
}
