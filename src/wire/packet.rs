//! Binary data-plane packet header (§4.C): `seqno:u32 | flags:u16 |
//! len:u16 | payload`.

use crate::error::{MeshError, Result};

pub const HEADER_LEN: usize = 4 + 2 + 2;

/// Data-plane packet flags. Hand-rolled rather than pulling in the
/// `bitflags` crate for a single u16 of four bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(pub u16);

impl PacketFlags {
    pub const PROBE: PacketFlags = PacketFlags(0x0001);
    pub const MTU_PROBE_REPLY: PacketFlags = PacketFlags(0x0002);
    pub const CHANNEL_DATA: PacketFlags = PacketFlags(0x0004);
    pub const CHANNEL_CONTROL: PacketFlags = PacketFlags(0x0008);

    pub fn contains(&self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;
    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub seqno: u32,
    pub flags: PacketFlags,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > u16::MAX as usize {
            return Err(MeshError::inval("packet payload exceeds 65535 bytes"));
        }
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.seqno.to_be_bytes());
        out.extend_from_slice(&self.flags.0.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(MeshError::inval("packet shorter than header"));
        }
        let seqno = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let flags = u16::from_be_bytes(buf[4..6].try_into().unwrap());
        let len = u16::from_be_bytes(buf[6..8].try_into().unwrap()) as usize;
        let payload = buf
            .get(HEADER_LEN..HEADER_LEN + len)
            .ok_or_else(|| MeshError::inval("packet payload shorter than declared length"))?
            .to_vec();
        Ok(Self {
            seqno,
            flags: PacketFlags(flags),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let pkt = Packet {
            seqno: 42,
            flags: PacketFlags::CHANNEL_DATA | PacketFlags::PROBE,
            payload: vec![1, 2, 3, 4],
        };
        let encoded = pkt.encode().unwrap();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.seqno, 42);
        assert!(decoded.flags.contains(PacketFlags::CHANNEL_DATA));
        assert!(decoded.flags.contains(PacketFlags::PROBE));
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[6..8].copy_from_slice(&10u16.to_be_bytes());
        assert!(Packet::decode(&buf).is_err());
    }

    #[test]
    fn rejects_oversized_payload() {
        let pkt = Packet {
            seqno: 0,
            flags: PacketFlags::default(),
            payload: vec![0u8; u16::MAX as usize + 1],
        };
        assert!(pkt.encode().is_err());
    }
}
