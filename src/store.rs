//! Node/edge store (§4.D): an in-memory indexed arena of nodes and
//! edges, plus on-disk persistence under `<confbase>/current/hosts/`.
//!
//! Grounded on the donor's `peers.rs` save/load idiom (one small serde
//! struct written with `serde_json::to_string_pretty` + `std::fs::write`),
//! generalized from one aggregate `peers.json` file to one file per node
//! and to an id-indexed arena instead of a flat `Vec<PeerInfo>`, per
//! REDESIGN FLAGS ("mutually referential node/edge structures... Implement
//! as an arena plus dense integer ids").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{MeshError, Result};
use crate::identity::DeviceClass;

/// Dense, reused-on-delete index into the node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Whether and how much of a node's config is written to disk (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePolicy {
    Disabled,
    KeysOnly,
    Enabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketAddrRecord {
    pub host: String,
    pub port: u16,
}

/// A node known to the local mesh (§3). The local node is one entry
/// among these, distinguished only by `self_id` on the owning `MeshState`.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub ed25519_public: VerifyingKey,
    pub canonical_addresses: Vec<SocketAddrRecord>,
    pub recent_addresses: Vec<SocketAddrRecord>,
    pub device_class: DeviceClass,
    pub options: u32,
    pub submesh: Option<String>,
    pub blacklisted: bool,
    pub last_reachable: Option<SystemTime>,
    pub last_unreachable: Option<SystemTime>,
}

impl Node {
    pub(crate) fn new(name: String, ed25519_public: VerifyingKey, device_class: DeviceClass) -> Self {
        Self {
            name,
            ed25519_public,
            canonical_addresses: Vec::new(),
            recent_addresses: Vec::new(),
            device_class,
            options: 0,
            submesh: None,
            blacklisted: false,
            last_reachable: None,
            last_unreachable: None,
        }
    }

    /// Whether this node is currently marked reachable, per invariant 4
    /// (`last_reachable >= last_unreachable` iff reachable).
    pub fn is_reachable(&self) -> bool {
        match (self.last_reachable, self.last_unreachable) {
            (Some(r), Some(u)) => r >= u,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// An edge `from -> to` as advertised by `from` (§3): the address it
/// observes for `to`, option flags, and a routing weight derived from
/// `to`'s device class.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub address: Option<SocketAddrRecord>,
    pub options: u32,
    pub weight: u32,
}

pub const OPT_INDIRECT: u32 = 0x0001;
pub const OPT_TUNNEL: u32 = 0x0002;

/// Edge weight derived from the remote endpoint's device class (§4.E):
/// lower class number (BACKBONE=0) means lower weight, preferred as a
/// next hop.
pub fn edge_weight(remote_class: DeviceClass) -> u32 {
    remote_class as u32 + 1
}

#[derive(Serialize, Deserialize)]
struct NodeDisk {
    name: String,
    ed25519_public_hex: String,
    device_class: DeviceClass,
    options: u32,
    submesh: Option<String>,
    blacklisted: bool,
    #[serde(default)]
    canonical_addresses: Vec<SocketAddrRecord>,
    #[serde(default)]
    recent_addresses: Vec<SocketAddrRecord>,
}

/// The node/edge arena for one mesh instance: a `Vec<Option<Node>>`
/// indexed by `NodeId`, a free list for id reuse, a name index, and an
/// adjacency list keyed by the edge's origin (§4.D: "name -> node",
/// "(from, to) -> edge", "for each node, the set of incident edges").
#[derive(Default)]
pub struct NodeStore {
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
    by_name: HashMap<String, NodeId>,
    edges: HashMap<(NodeId, NodeId), Edge>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(
        &mut self,
        name: &str,
        ed25519_public: VerifyingKey,
        device_class: DeviceClass,
    ) -> Result<NodeId> {
        if self.by_name.contains_key(name) {
            return Err(MeshError::exist(format!("node {name} already exists")));
        }
        let node = Node::new(name.to_string(), ed25519_public, device_class);
        let id = if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = Some(node);
            NodeId(idx)
        } else {
            self.nodes.push(Some(node));
            NodeId((self.nodes.len() - 1) as u32)
        };
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize).and_then(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0 as usize).and_then(|n| n.as_mut())
    }

    pub fn id_by_name(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.id_by_name(name).and_then(|id| self.node(id))
    }

    pub fn all_node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|_| NodeId(i as u32)))
    }

    /// Edges whose origin is `id` — "for each node, the set of incident
    /// edges" (§4.D), materialized lazily rather than cached, since the
    /// edge map is already keyed by `(from, to)`.
    pub fn edges_from(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.values().filter(move |e| e.from == id)
    }

    pub fn edge(&self, from: NodeId, to: NodeId) -> Option<&Edge> {
        self.edges.get(&(from, to))
    }

    /// Both directions present — the subset routing is allowed to use
    /// (invariant 1).
    pub fn has_reverse(&self, from: NodeId, to: NodeId) -> bool {
        self.edges.contains_key(&(to, from))
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.insert((edge.from, edge.to), edge);
    }

    pub fn del_edge(&mut self, from: NodeId, to: NodeId) -> Option<Edge> {
        self.edges.remove(&(from, to))
    }

    /// Deletes every edge originating from `id`, as happens when that
    /// node's meta-connection drops (§3: "deleted when that endpoint's
    /// meta-connection drops").
    pub fn del_edges_from(&mut self, id: NodeId) {
        self.edges.retain(|(from, _), _| *from != id);
    }

    pub fn all_edges(&self) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.values()
    }

    /// Forgets a node entirely. Per §9/open questions, only valid while
    /// unreachable; callers (the public API) are responsible for the
    /// `BUSY` gate, this just performs the removal.
    pub fn forget_node(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(id.0 as usize).and_then(|n| n.take()) {
            self.by_name.remove(&node.name);
        }
        self.edges.retain(|(from, to), _| *from != id && *to != id);
        self.free.push(id.0);
    }

    pub fn by_dev_class(&self, class: DeviceClass) -> Vec<NodeId> {
        self.all_node_ids()
            .filter(|id| self.node(*id).map(|n| n.device_class) == Some(class))
            .collect()
    }

    pub fn by_submesh(&self, submesh: &str) -> Vec<NodeId> {
        self.all_node_ids()
            .filter(|id| self.node(*id).and_then(|n| n.submesh.as_deref()) == Some(submesh))
            .collect()
    }

    pub fn by_blacklisted(&self, blacklisted: bool) -> Vec<NodeId> {
        self.all_node_ids()
            .filter(|id| self.node(*id).map(|n| n.blacklisted) == Some(blacklisted))
            .collect()
    }
}

/// Persists one node's durable record to `hosts/<name>` under
/// `confbase/current`, honoring the storage policy (§4.D: `KEYS_ONLY`
/// drops volatile fields, `DISABLED` writes nothing).
pub fn save_node(hosts_dir: &Path, node: &Node, policy: StoragePolicy) -> Result<()> {
    if policy == StoragePolicy::Disabled {
        return Ok(());
    }
    std::fs::create_dir_all(hosts_dir)?;
    let disk = NodeDisk {
        name: node.name.clone(),
        ed25519_public_hex: hex::encode(node.ed25519_public.to_bytes()),
        device_class: node.device_class,
        options: node.options,
        submesh: node.submesh.clone(),
        blacklisted: node.blacklisted,
        canonical_addresses: if policy == StoragePolicy::Enabled {
            node.canonical_addresses.clone()
        } else {
            Vec::new()
        },
        recent_addresses: if policy == StoragePolicy::Enabled {
            node.recent_addresses.clone()
        } else {
            Vec::new()
        },
    };
    let data = serde_json::to_string_pretty(&disk)?;
    std::fs::write(node_path(hosts_dir, &node.name), data)?;
    Ok(())
}

pub fn load_node(hosts_dir: &Path, name: &str) -> Result<Node> {
    let data = std::fs::read_to_string(node_path(hosts_dir, name))?;
    let disk: NodeDisk = serde_json::from_str(&data)?;
    let pub_bytes: [u8; 32] = hex::decode(&disk.ed25519_public_hex)
        .map_err(|e| MeshError::storage(format!("bad public key hex: {e}")))?
        .try_into()
        .map_err(|_| MeshError::storage("public key wrong length"))?;
    let ed25519_public = VerifyingKey::from_bytes(&pub_bytes)
        .map_err(|e| MeshError::storage(format!("bad public key: {e}")))?;
    let mut node = Node::new(disk.name, ed25519_public, disk.device_class);
    node.options = disk.options;
    node.submesh = disk.submesh;
    node.blacklisted = disk.blacklisted;
    node.canonical_addresses = disk.canonical_addresses;
    node.recent_addresses = disk.recent_addresses;
    Ok(node)
}

pub fn list_stored_names(hosts_dir: &Path) -> Result<Vec<String>> {
    if !hosts_dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(hosts_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

pub fn delete_node_file(hosts_dir: &Path, name: &str) -> Result<()> {
    let path = node_path(hosts_dir, name);
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

fn node_path(hosts_dir: &Path, name: &str) -> PathBuf {
    hosts_dir.join(name)
}

// ---- At-rest encryption envelope (§4.D, §6) ----

const ENVELOPE_VERSION: u8 = 1;
const ENVELOPE_SALT_LEN: usize = 16;
const ENVELOPE_NONCE_LEN: usize = 12;
/// Work factor for the passphrase-stretching HKDF-expansion loop (§4.D:
/// "a slow KDF"; DESIGN.md records the choice of repeated HKDF expansion
/// over pulling in a new KDF crate like Argon2/scrypt).
const ENVELOPE_KDF_ROUNDS: u32 = 20_000;

/// Derives a 32-byte file key from a passphrase and salt via repeated
/// HKDF-SHA512 expansion, intentionally slow to raise the cost of an
/// offline passphrase guess.
pub fn derive_envelope_key(passphrase: &str, salt: &[u8; ENVELOPE_SALT_LEN]) -> [u8; 32] {
    let mut material = passphrase.as_bytes().to_vec();
    for round in 0..ENVELOPE_KDF_ROUNDS {
        material = crypto::kdf(&material, salt, &round.to_be_bytes(), 32);
    }
    material.try_into().unwrap()
}

/// Wraps `plaintext` in `version(1) | salt(16) | nonce(12) | ciphertext |
/// tag(16)` (§6), deriving the file key fresh from `passphrase` and a
/// random salt.
pub fn seal_envelope(passphrase: &str, plaintext: &[u8]) -> Vec<u8> {
    let salt: [u8; ENVELOPE_SALT_LEN] = crypto::random_array();
    let key_bytes = derive_envelope_key(passphrase, &salt);
    let key = crypto::AeadKey::from_bytes(key_bytes);
    let nonce: [u8; ENVELOPE_NONCE_LEN] = crypto::random_array();
    let seqno = u64::from_be_bytes(nonce[4..].try_into().unwrap());
    let ciphertext = key
        .seal(seqno, plaintext, &[ENVELOPE_VERSION])
        .expect("envelope seal cannot fail for well-formed input");
    let mut out = Vec::with_capacity(1 + ENVELOPE_SALT_LEN + ENVELOPE_NONCE_LEN + ciphertext.len());
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

/// Opens an envelope produced by [`seal_envelope`]. Fails with
/// `STORAGE` on a version mismatch or wrong passphrase (AEAD tag
/// mismatch), per §4.D ("concurrent opens with the wrong key fail with
/// STORAGE").
pub fn open_envelope(passphrase: &str, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 1 + ENVELOPE_SALT_LEN + ENVELOPE_NONCE_LEN + 16 {
        return Err(MeshError::storage("envelope truncated"));
    }
    let version = data[0];
    if version != ENVELOPE_VERSION {
        return Err(MeshError::storage(format!(
            "unsupported envelope version {version}"
        )));
    }
    let salt: [u8; ENVELOPE_SALT_LEN] = data[1..1 + ENVELOPE_SALT_LEN].try_into().unwrap();
    let nonce_off = 1 + ENVELOPE_SALT_LEN;
    let nonce: [u8; ENVELOPE_NONCE_LEN] =
        data[nonce_off..nonce_off + ENVELOPE_NONCE_LEN].try_into().unwrap();
    let ciphertext = &data[nonce_off + ENVELOPE_NONCE_LEN..];
    let key_bytes = derive_envelope_key(passphrase, &salt);
    let key = crypto::AeadKey::from_bytes(key_bytes);
    let seqno = u64::from_be_bytes(nonce[4..].try_into().unwrap());
    key.open(seqno, ciphertext, &[ENVELOPE_VERSION])
        .map_err(|_| MeshError::storage("envelope open failed: wrong passphrase or corrupt file"))
}

/// Rotates the at-rest key for an encrypted `current/` tree: write a
/// fully re-encrypted shadow copy under `new/`, fsync, atomically swap
/// it in for `current/`, then remove the old tree (§4.D, invariant 5).
/// Any crash before the final rename leaves `current/` (old key) valid;
/// any crash after leaves the renamed tree (new key) valid — never a mix.
pub fn rotate_envelope_key(confbase: &Path, old_passphrase: &str, new_passphrase: &str) -> Result<()> {
    let current = confbase.join("current");
    let staging = confbase.join("new");
    let old = confbase.join("old");

    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    for entry in walk_files(&current)? {
        let rel = entry.strip_prefix(&current).unwrap();
        let dest = staging.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = std::fs::read(&entry)?;
        let plain = open_envelope(old_passphrase, &data)?;
        let resealed = seal_envelope(new_passphrase, &plain);
        std::fs::write(&dest, resealed)?;
    }
    fsync_dir(&staging)?;

    if old.exists() {
        std::fs::remove_dir_all(&old)?;
    }
    std::fs::rename(&current, &old)?;
    std::fs::rename(&staging, &current)?;
    fsync_dir(confbase)?;
    std::fs::remove_dir_all(&old)?;
    Ok(())
}

fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in std::fs::read_dir(&d)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    Ok(out)
}

fn fsync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let f = std::fs::File::open(dir)?;
        f.sync_all()?;
    }
    let _ = dir;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningIdentity;

    fn key() -> VerifyingKey {
        SigningIdentity::generate().verifying_key()
    }

    #[test]
    fn insert_and_lookup_roundtrip() {
        let mut store = NodeStore::new();
        let id = store
            .insert_node("foo", key(), DeviceClass::Stationary)
            .unwrap();
        assert_eq!(store.id_by_name("foo"), Some(id));
        assert_eq!(store.node(id).unwrap().name, "foo");
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut store = NodeStore::new();
        store.insert_node("foo", key(), DeviceClass::Backbone).unwrap();
        assert!(store
            .insert_node("foo", key(), DeviceClass::Backbone)
            .is_err());
    }

    #[test]
    fn forget_node_frees_id_and_edges() {
        let mut store = NodeStore::new();
        let a = store.insert_node("a", key(), DeviceClass::Backbone).unwrap();
        let b = store.insert_node("b", key(), DeviceClass::Backbone).unwrap();
        store.add_edge(Edge {
            from: a,
            to: b,
            address: None,
            options: 0,
            weight: 1,
        });
        store.forget_node(a);
        assert!(store.node(a).is_none());
        assert!(store.edge(a, b).is_none());
        let c = store.insert_node("c", key(), DeviceClass::Backbone).unwrap();
        assert_eq!(c, a, "freed id should be reused");
    }

    #[test]
    fn reverse_edge_detection() {
        let mut store = NodeStore::new();
        let a = store.insert_node("a", key(), DeviceClass::Backbone).unwrap();
        let b = store.insert_node("b", key(), DeviceClass::Backbone).unwrap();
        store.add_edge(Edge {
            from: a,
            to: b,
            address: None,
            options: 0,
            weight: 1,
        });
        assert!(!store.has_reverse(a, b));
        store.add_edge(Edge {
            from: b,
            to: a,
            address: None,
            options: 0,
            weight: 1,
        });
        assert!(store.has_reverse(a, b));
    }

    #[test]
    fn node_disk_roundtrip_respects_storage_policy() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        let mut node = Node::new("foo".to_string(), key(), DeviceClass::Portable);
        node.canonical_addresses.push(SocketAddrRecord {
            host: "203.0.113.1".to_string(),
            port: 655,
        });

        save_node(&hosts, &node, StoragePolicy::KeysOnly).unwrap();
        let loaded = load_node(&hosts, "foo").unwrap();
        assert!(loaded.canonical_addresses.is_empty(), "KEYS_ONLY must drop addresses");

        save_node(&hosts, &node, StoragePolicy::Enabled).unwrap();
        let loaded = load_node(&hosts, "foo").unwrap();
        assert_eq!(loaded.canonical_addresses, node.canonical_addresses);
    }

    #[test]
    fn envelope_roundtrip_and_wrong_key_fails() {
        let sealed = seal_envelope("correct horse", b"top secret node list");
        let opened = open_envelope("correct horse", &sealed).unwrap();
        assert_eq!(opened, b"top secret node list");
        assert!(open_envelope("wrong passphrase", &sealed).is_err());
    }

    #[test]
    fn key_rotation_swaps_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let confbase = dir.path();
        let current = confbase.join("current").join("hosts");
        std::fs::create_dir_all(&current).unwrap();
        std::fs::write(current.join("foo"), seal_envelope("old-pass", b"foo record")).unwrap();

        rotate_envelope_key(confbase, "old-pass", "new-pass").unwrap();

        let data = std::fs::read(confbase.join("current").join("hosts").join("foo")).unwrap();
        assert!(open_envelope("new-pass", &data).is_ok());
        assert!(open_envelope("old-pass", &data).is_err());
        assert!(!confbase.join("old").exists());
    }
}
