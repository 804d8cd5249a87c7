//! Configuration directory layout and mesh-open options (§6).
//!
//! Grounded on the donor's `Args`/data-dir conventions in `main.rs`
//! (a base directory the process owns exclusively, created on first
//! use), generalized into the spec's fixed
//! `<confbase>/current/{meshlink.conf,hosts,invitations,lock}` layout.

use std::fs::OpenOptions;
use std::path::PathBuf;

use fs4::FileExt;

use crate::error::{MeshError, Result};
use crate::identity::DeviceClass;
use crate::store::StoragePolicy;

pub const DEFAULT_PORT: u16 = 655;

/// Paths derived from a mesh instance's configuration base directory
/// (§6).
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub confbase: PathBuf,
}

impl ConfigPaths {
    pub fn new(confbase: impl Into<PathBuf>) -> Self {
        Self {
            confbase: confbase.into(),
        }
    }

    pub fn current(&self) -> PathBuf {
        self.confbase.join("current")
    }

    pub fn identity_file(&self) -> PathBuf {
        self.current().join("meshlink.conf")
    }

    pub fn hosts_dir(&self) -> PathBuf {
        self.current().join("hosts")
    }

    pub fn invitations_dir(&self) -> PathBuf {
        self.current().join("invitations")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.current().join("lock")
    }

    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(self.hosts_dir())?;
        std::fs::create_dir_all(self.invitations_dir())?;
        Ok(())
    }
}

/// Holds the exclusive advisory lock on a configuration directory for
/// as long as a mesh instance has it open (§5: "exactly one process
/// may hold an open mesh on a given configuration directory; enforced
/// by an exclusive file lock on a sentinel file").
pub struct DirLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl DirLock {
    pub fn acquire(paths: &ConfigPaths) -> Result<Self> {
        paths.ensure_layout()?;
        let path = paths.lock_file();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            MeshError::busy(format!(
                "configuration directory {} is already open by another process",
                paths.confbase.display()
            ))
        })?;
        Ok(Self { _file: file, path })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self._file);
        let _ = &self.path;
    }
}

/// Builder-style options for `Mesh::open*` (§4.K), generalizing the
/// donor's `Args` (base dir + listen port) with the spec's additional
/// identity, storage, and submesh knobs.
#[derive(Debug, Clone)]
pub struct MeshOptions {
    pub confbase: PathBuf,
    pub name: String,
    pub device_class: DeviceClass,
    pub port: u16,
    pub storage_policy: StoragePolicy,
    pub encryption_passphrase: Option<String>,
    pub submesh: Option<String>,
}

impl MeshOptions {
    pub fn new(confbase: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            confbase: confbase.into(),
            name: name.into(),
            device_class: DeviceClass::Unknown,
            port: DEFAULT_PORT,
            storage_policy: StoragePolicy::Enabled,
            encryption_passphrase: None,
            submesh: None,
        }
    }

    pub fn device_class(mut self, class: DeviceClass) -> Self {
        self.device_class = class;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn storage_policy(mut self, policy: StoragePolicy) -> Self {
        self.storage_policy = policy;
        self
    }

    pub fn encrypted(mut self, passphrase: impl Into<String>) -> Self {
        self.encryption_passphrase = Some(passphrase.into());
        self
    }

    /// `open_ephemeral`: no on-disk footprint at all (§4.K).
    pub fn ephemeral(mut self) -> Self {
        self.storage_policy = StoragePolicy::Disabled;
        self
    }

    pub fn submesh(mut self, tag: impl Into<String>) -> Self {
        self.submesh = Some(tag.into());
        self
    }

    pub fn paths(&self) -> ConfigPaths {
        ConfigPaths::new(&self.confbase)
    }
}

fn validate_port(port: u16) -> Result<u16> {
    if port == 0 {
        return Err(MeshError::inval("port must be nonzero"));
    }
    Ok(port)
}

impl MeshOptions {
    pub fn validated(self) -> Result<Self> {
        validate_port(self.port)?;
        crate::identity::validate_name(&self.name)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_creates_expected_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::new(dir.path());
        paths.ensure_layout().unwrap();
        assert!(paths.hosts_dir().exists());
        assert!(paths.invitations_dir().exists());
    }

    #[test]
    fn second_lock_on_same_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::new(dir.path());
        let _first = DirLock::acquire(&paths).unwrap();
        assert!(DirLock::acquire(&paths).is_err());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::new(dir.path());
        {
            let _first = DirLock::acquire(&paths).unwrap();
        }
        assert!(DirLock::acquire(&paths).is_ok());
    }

    #[test]
    fn options_builder_rejects_bad_name() {
        let opts = MeshOptions::new("/tmp/whatever", "bad name").validated();
        assert!(opts.is_err());
    }
}
