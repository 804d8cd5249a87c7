//! Stable error surface for the public API.

use std::fmt;

/// Stable, enumerated error kind. Matches the fixed vocabulary embedders
/// can match on without caring about the underlying cause string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Ok,
    NoMem,
    NoEnt,
    Exist,
    Inval,
    Busy,
    Timeout,
    Network,
    Storage,
    Crypto,
    Unauthorized,
    PeerUnreachable,
    ChannelClosed,
    Version,
    Blacklisted,
    ResourceLimit,
}

impl ErrorKind {
    /// Human-readable string, the `strerror`-style accessor from §6.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Ok => "no error",
            ErrorKind::NoMem => "out of memory",
            ErrorKind::NoEnt => "no such node or entry",
            ErrorKind::Exist => "entry already exists",
            ErrorKind::Inval => "invalid argument",
            ErrorKind::Busy => "resource busy",
            ErrorKind::Timeout => "operation timed out",
            ErrorKind::Network => "network error",
            ErrorKind::Storage => "storage error",
            ErrorKind::Crypto => "cryptographic error",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::PeerUnreachable => "peer unreachable",
            ErrorKind::ChannelClosed => "channel closed",
            ErrorKind::Version => "protocol version mismatch",
            ErrorKind::Blacklisted => "peer is blacklisted",
            ErrorKind::ResourceLimit => "resource limit exceeded",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The crate's public error type. Carries a stable [`ErrorKind`] plus a
/// human-readable cause for logs and debugging.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct MeshError {
    pub kind: ErrorKind,
    pub message: String,
}

impl MeshError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

macro_rules! ctor {
    ($name:ident, $kind:ident) => {
        pub fn $name(message: impl Into<String>) -> Self {
            Self::new(ErrorKind::$kind, message)
        }
    };
}

impl MeshError {
    ctor!(no_mem, NoMem);
    ctor!(no_ent, NoEnt);
    ctor!(exist, Exist);
    ctor!(inval, Inval);
    ctor!(busy, Busy);
    ctor!(timeout, Timeout);
    ctor!(network, Network);
    ctor!(storage, Storage);
    ctor!(crypto, Crypto);
    ctor!(unauthorized, Unauthorized);
    ctor!(peer_unreachable, PeerUnreachable);
    ctor!(channel_closed, ChannelClosed);
    ctor!(version, Version);
    ctor!(blacklisted, Blacklisted);
    ctor!(resource_limit, ResourceLimit);
}

impl From<std::io::Error> for MeshError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match e.kind() {
            IoKind::NotFound => ErrorKind::NoEnt,
            IoKind::AlreadyExists => ErrorKind::Exist,
            IoKind::TimedOut => ErrorKind::Timeout,
            IoKind::WouldBlock => ErrorKind::Busy,
            _ => ErrorKind::Network,
        };
        MeshError::new(kind, e.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::new(ErrorKind::Storage, format!("malformed record: {e}"))
    }
}

/// Convenience alias used throughout the crate's public surface.
pub type Result<T> = std::result::Result<T, MeshError>;

/// Per-handle "last error" slot, for embedders that prefer to check after
/// the fact rather than always matching on a returned `Result`.
#[derive(Default)]
pub struct LastError(std::sync::Mutex<Option<MeshError>>);

impl LastError {
    pub fn set(&self, kind: ErrorKind, message: impl Into<String>) {
        *self.0.lock().unwrap() = Some(MeshError::new(kind, message));
    }

    pub fn record(&self, err: &MeshError) {
        *self.0.lock().unwrap() = Some(MeshError::new(err.kind, err.message.clone()));
    }

    pub fn clear(&self) {
        *self.0.lock().unwrap() = None;
    }

    pub fn get(&self) -> Option<(ErrorKind, String)> {
        self.0
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| (e.kind, e.message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strerror_matches_kind() {
        let e = MeshError::unauthorized("bad signature");
        assert_eq!(e.kind(), ErrorKind::Unauthorized);
        assert!(e.to_string().contains("bad signature"));
    }

    #[test]
    fn last_error_roundtrip() {
        let slot = LastError::default();
        assert!(slot.get().is_none());
        slot.set(ErrorKind::Busy, "cookie already redeemed");
        let (kind, msg) = slot.get().unwrap();
        assert_eq!(kind, ErrorKind::Busy);
        assert_eq!(msg, "cookie already redeemed");
        slot.clear();
        assert!(slot.get().is_none());
    }
}
