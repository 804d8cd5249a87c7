//! SPTPS — Simple Peer-to-Peer Security: the authenticated-encryption
//! record layer used by both meta-connections (stream substrate) and
//! UDP sessions (datagram substrate).
//!
//! Handshake shape (KEX/SIG/ACK exchange, directional key derivation) is
//! grounded on the donor's `handshake.rs`; the dual
//! encrypt/decrypt-state-per-direction idiom and the "extract crypto
//! material before any blocking work" pattern come from the donor's
//! `HandshakeKeys`/`transport.rs`. The actual primitives differ: a
//! direct X25519 ECDH + Ed25519 transcript signature instead of
//! Noise_XX, and a single ChaCha20-Poly1305 AEAD layer instead of a
//! Noise+ML-KEM double layer.

use std::time::{Duration, Instant};

use ed25519_dalek::VerifyingKey;
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::crypto::{self, AeadKey, EphemeralEcdhKey, SigningIdentity};
use crate::error::{MeshError, Result};

/// Record type byte: `< 128` is an application record, `>= 128` is a
/// handshake/rekey record (§4.B).
pub const TYPE_APPLICATION_MAX: u8 = 127;
pub const TYPE_KEX: u8 = 128;
pub const TYPE_SIG: u8 = 129;
pub const TYPE_ACK: u8 = 130;

pub const PROTOCOL_VERSION: u8 = 1;

/// Rekey after this many records in one direction...
pub const REKEY_AFTER_RECORDS: u64 = 1 << 32;
/// ...or this much wall time, whichever comes first.
pub const REKEY_AFTER_DURATION: Duration = Duration::from_secs(3600);

/// Size of the replay-detection sliding window, in sequence numbers.
const REPLAY_WINDOW: u32 = 32;

/// `KEX`: ephemeral X25519 public key plus a protocol-version byte and a
/// free-form label (used to bind the handshake to a specific peer name).
#[derive(Debug, Clone)]
pub struct KexMessage {
    pub version: u8,
    pub ephemeral_public: X25519PublicKey,
    pub label: String,
}

impl KexMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 32 + self.label.len());
        out.push(self.version);
        out.extend_from_slice(self.ephemeral_public.as_bytes());
        out.extend_from_slice(self.label.as_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 33 {
            return Err(MeshError::inval("KEX message too short"));
        }
        let version = buf[0];
        let ephemeral_public =
            X25519PublicKey::from(<[u8; 32]>::try_from(&buf[1..33]).unwrap());
        let label = String::from_utf8_lossy(&buf[33..]).into_owned();
        Ok(Self {
            version,
            ephemeral_public,
            label,
        })
    }
}

/// `SIG`: an Ed25519 signature over the handshake transcript (both
/// sides' KEX messages concatenated), proving possession of the static
/// identity key without ever putting it on the wire in the clear.
#[derive(Debug, Clone)]
pub struct SigMessage {
    pub signature: [u8; crypto::ED25519_SIGNATURE_LEN],
}

/// `ACK`: handshake complete, directional keys are live.
#[derive(Debug, Clone, Copy)]
pub struct AckMessage;

fn transcript(local_kex: &[u8], remote_kex: &[u8], local_is_initiator: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(local_kex.len() + remote_kex.len());
    if local_is_initiator {
        out.extend_from_slice(local_kex);
        out.extend_from_slice(remote_kex);
    } else {
        out.extend_from_slice(remote_kex);
        out.extend_from_slice(local_kex);
    }
    out
}

/// Runs both sides of a handshake in-process given each side's identity
/// and ephemeral keys, returning the pair of established sessions. This
/// is the synchronous core; callers driving an actual socket perform the
/// same steps across the wire (see `meta.rs`/`udp.rs`), sending/parsing
/// `KexMessage`/`SigMessage`/`AckMessage` as they go.
pub fn derive_session_keys(
    shared_secret: &[u8; 32],
    transcript: &[u8],
) -> (AeadKey, AeadKey) {
    let initiator_to_responder =
        crypto::kdf(shared_secret, transcript, b"sptps-initiator-to-responder", 32);
    let responder_to_initiator =
        crypto::kdf(shared_secret, transcript, b"sptps-responder-to-initiator", 32);
    (
        AeadKey::from_bytes(initiator_to_responder.try_into().unwrap()),
        AeadKey::from_bytes(responder_to_initiator.try_into().unwrap()),
    )
}

/// One side's half of an in-progress handshake: an ephemeral keypair and
/// the label to bind it to.
pub struct HandshakeState {
    pub ephemeral: EphemeralEcdhKey,
    pub local_kex: KexMessage,
    pub is_initiator: bool,
}

impl HandshakeState {
    pub fn start(is_initiator: bool, local_name: &str) -> Self {
        let (ephemeral, public) = EphemeralEcdhKey::generate();
        let local_kex = KexMessage {
            version: PROTOCOL_VERSION,
            ephemeral_public: public,
            label: local_name.to_string(),
        };
        Self {
            ephemeral,
            local_kex,
            is_initiator,
        }
    }

    pub fn sign_transcript(&self, signing: &SigningIdentity, remote_kex: &KexMessage) -> SigMessage {
        let t = transcript(
            &self.local_kex.encode(),
            &remote_kex.encode(),
            self.is_initiator,
        );
        SigMessage {
            signature: signing.sign(&t),
        }
    }

    pub fn verify_transcript(
        &self,
        remote_identity: &VerifyingKey,
        remote_kex: &KexMessage,
        remote_sig: &SigMessage,
    ) -> Result<()> {
        if remote_kex.version != PROTOCOL_VERSION {
            return Err(MeshError::version(format!(
                "peer SPTPS version {} unsupported",
                remote_kex.version
            )));
        }
        let t = transcript(
            &remote_kex.encode(),
            &self.local_kex.encode(),
            !self.is_initiator,
        );
        crypto::ed25519_verify(remote_identity, &t, &remote_sig.signature)
            .map_err(|_| MeshError::unauthorized("SPTPS handshake signature invalid"))
    }

    /// Completes the handshake: ECDH with the peer's ephemeral key, then
    /// derive both directional AEAD keys from the resulting shared
    /// secret and the two sides' concatenated KEX transcript.
    pub fn finish(self, remote_kex: &KexMessage) -> Result<(AeadKey, AeadKey)> {
        let shared = self.ephemeral.diffie_hellman(&remote_kex.ephemeral_public)?;
        let t = transcript(
            &self.local_kex.encode(),
            &remote_kex.encode(),
            self.is_initiator,
        );
        let (i2r, r2i) = derive_session_keys(&shared, &t);
        // both sides derive the same (i2r, r2i) pair from the symmetric
        // shared secret; each side's send key is the direction it writes
        // in, so only the initiator sends on i2r — the responder sends on
        // r2i and listens on i2r.
        if self.is_initiator {
            Ok((i2r, r2i))
        } else {
            Ok((r2i, i2r))
        }
    }
}

/// A sliding replay window over 32-bit sequence numbers (§4.B).
#[derive(Debug, Default)]
struct ReplayWindow {
    highest: Option<u32>,
    mask: u32,
}

impl ReplayWindow {
    fn accept(&mut self, seqno: u32) -> Result<()> {
        match self.highest {
            None => {
                self.highest = Some(seqno);
                self.mask = 1;
                Ok(())
            }
            Some(highest) => {
                if seqno > highest {
                    let shift = seqno - highest;
                    self.mask = if shift as u64 >= REPLAY_WINDOW as u64 {
                        1
                    } else {
                        (self.mask << shift) | 1
                    };
                    self.highest = Some(seqno);
                    Ok(())
                } else {
                    let back = highest - seqno;
                    if back as u64 >= REPLAY_WINDOW as u64 {
                        return Err(MeshError::crypto("record outside replay window"));
                    }
                    let bit = 1u32 << back;
                    if self.mask & bit != 0 {
                        return Err(MeshError::crypto("replayed record rejected"));
                    }
                    self.mask |= bit;
                    Ok(())
                }
            }
        }
    }
}

/// An established, live SPTPS session: two directional AEAD keys, a
/// monotonically increasing send counter, and a replay window on the
/// receive side. One instance is shared by a meta-connection's control
/// traffic and (indirectly, via the same derived keys) the datagram
/// records sent over an associated UDP session.
pub struct SptpsSession {
    send_key: AeadKey,
    send_seq: u64,
    recv_key: AeadKey,
    replay: ReplayWindow,
    established_at: Instant,
    records_sent: u64,
    old_recv_key: Option<(AeadKey, Instant)>,
}

impl SptpsSession {
    pub fn new(send_key: AeadKey, recv_key: AeadKey) -> Self {
        Self {
            send_key,
            send_seq: 0,
            recv_key,
            replay: ReplayWindow::default(),
            established_at: Instant::now(),
            records_sent: 0,
            old_recv_key: None,
        }
    }

    /// Encrypts one application record. `record_type` must be `<= 127`.
    pub fn seal(&mut self, record_type: u8, plaintext: &[u8]) -> Result<(u64, Vec<u8>)> {
        if record_type > TYPE_APPLICATION_MAX {
            return Err(MeshError::inval("application record type must be < 128"));
        }
        let seqno = self.send_seq;
        self.send_seq += 1;
        self.records_sent += 1;
        let aad = [record_type];
        let ct = self.send_key.seal(seqno, plaintext, &aad)?;
        Ok((seqno, ct))
    }

    /// Decrypts one received record, rejecting replays. Tries the
    /// current receive key first, then a still-warm previous key if a
    /// rekey is in flight.
    pub fn open(&mut self, record_type: u8, seqno: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.replay.accept(seqno as u32)?;
        let aad = [record_type];
        if let Ok(pt) = self.recv_key.open(seqno, ciphertext, &aad) {
            return Ok(pt);
        }
        if let Some((old_key, _)) = &self.old_recv_key {
            return old_key.open(seqno, ciphertext, &aad);
        }
        Err(MeshError::crypto("SPTPS record failed to decrypt"))
    }

    /// Whether either the record-count or time threshold for a rekey has
    /// been crossed (§4.B).
    pub fn needs_rekey(&self) -> bool {
        self.records_sent >= REKEY_AFTER_RECORDS
            || self.established_at.elapsed() >= REKEY_AFTER_DURATION
    }

    /// Installs freshly derived keys after a successful `KEX`/`SIG`/`ACK`
    /// rekey exchange, keeping the old receive key alive briefly to
    /// absorb records already in flight. The sequence-number counter and
    /// replay window are NOT reset: they are a property of the
    /// direction, not the key epoch, so a record sent just before rekey
    /// and one sent just after never collide on the same seqno.
    pub fn rekey(&mut self, send_key: AeadKey, recv_key: AeadKey) {
        let old = std::mem::replace(&mut self.recv_key, recv_key);
        self.old_recv_key = Some((old, Instant::now()));
        self.send_key = send_key;
        self.records_sent = 0;
        self.established_at = Instant::now();
    }

    /// Drops the retained previous receive key once one RTT-equivalent
    /// window has passed, per §4.B ("old keys are retained for one RTT
    /// ... then destroyed").
    pub fn expire_old_key(&mut self, rtt_estimate: Duration) {
        if let Some((_, installed_at)) = &self.old_recv_key {
            if installed_at.elapsed() >= rtt_estimate {
                self.old_recv_key = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_pair(a_name: &str, b_name: &str) -> (SptpsSession, SptpsSession) {
        let a_identity = SigningIdentity::generate();
        let b_identity = SigningIdentity::generate();

        let a_hs = HandshakeState::start(true, a_name);
        let b_hs = HandshakeState::start(false, b_name);

        let a_kex = a_hs.local_kex.clone();
        let b_kex = b_hs.local_kex.clone();

        let a_sig = a_hs.sign_transcript(&a_identity, &b_kex);
        let b_sig = b_hs.sign_transcript(&b_identity, &a_kex);

        a_hs.verify_transcript(&b_identity.verifying_key(), &b_kex, &b_sig)
            .unwrap();
        b_hs.verify_transcript(&a_identity.verifying_key(), &a_kex, &a_sig)
            .unwrap();

        let (a_send, a_recv) = a_hs.finish(&b_kex).unwrap();
        let (b_send, b_recv) = b_hs.finish(&a_kex).unwrap();

        // initiator's send key is the responder's recv key and vice versa
        (SptpsSession::new(a_send, a_recv), SptpsSession::new(b_send, b_recv))
    }

    #[test]
    fn handshake_establishes_usable_session() {
        let (mut a, mut b) = handshake_pair("foo", "bar");
        let (seq, ct) = a.seal(0, b"hello").unwrap();
        let pt = b.open(0, seq, &ct).unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn rejects_bad_signature() {
        let a_identity = SigningIdentity::generate();
        let wrong_identity = SigningIdentity::generate();
        let a_hs = HandshakeState::start(true, "foo");
        let b_hs = HandshakeState::start(false, "bar");
        let a_kex = a_hs.local_kex.clone();
        let b_kex = b_hs.local_kex.clone();
        let a_sig = a_hs.sign_transcript(&a_identity, &b_kex);
        let result = b_hs.verify_transcript(&wrong_identity.verifying_key(), &a_kex, &a_sig);
        assert!(result.is_err());
    }

    #[test]
    fn replay_window_rejects_duplicate() {
        let (mut a, mut b) = handshake_pair("foo", "bar");
        let (seq, ct) = a.seal(0, b"once").unwrap();
        assert!(b.open(0, seq, &ct).is_ok());
        assert!(b.open(0, seq, &ct).is_err());
    }

    #[test]
    fn replay_window_accepts_reorder_within_window() {
        let (mut a, mut b) = handshake_pair("foo", "bar");
        let (seq1, ct1) = a.seal(0, b"first").unwrap();
        let (seq2, ct2) = a.seal(0, b"second").unwrap();
        // deliver out of order
        assert!(b.open(0, seq2, &ct2).is_ok());
        assert!(b.open(0, seq1, &ct1).is_ok());
    }

    #[test]
    fn rekey_keeps_old_key_briefly() {
        let (mut a, mut b) = handshake_pair("foo", "bar");
        let (seq_old, ct_old) = a.seal(0, b"before rekey").unwrap();

        let a_identity = SigningIdentity::generate();
        let b_identity = SigningIdentity::generate();
        let a_hs = HandshakeState::start(true, "foo");
        let b_hs = HandshakeState::start(false, "bar");
        let a_kex = a_hs.local_kex.clone();
        let b_kex = b_hs.local_kex.clone();
        let a_sig = a_hs.sign_transcript(&a_identity, &b_kex);
        let b_sig = b_hs.sign_transcript(&b_identity, &a_kex);
        a_hs.verify_transcript(&b_identity.verifying_key(), &b_kex, &b_sig)
            .unwrap();
        b_hs.verify_transcript(&a_identity.verifying_key(), &a_kex, &a_sig)
            .unwrap();
        let (a_send, a_recv) = a_hs.finish(&b_kex).unwrap();
        let (b_send, b_recv) = b_hs.finish(&a_kex).unwrap();

        a.rekey(a_send, a_recv);
        b.rekey(b_send, b_recv);

        // record sealed before rekey still decrypts against the retained old key
        let pt_old = b.open(0, seq_old, &ct_old).unwrap();
        assert_eq!(pt_old, b"before rekey");

        let (seq_new, ct_new) = a.seal(0, b"after rekey").unwrap();
        assert!(b.open(0, seq_new, &ct_new).is_ok());
    }
}
