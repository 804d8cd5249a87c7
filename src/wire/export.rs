//! Export blob format (§4.C): a multi-line, LF-separated record —
//! `Name`, `DeviceClass`, `Ed25519PublicKey`, one or more `Address`
//! lines. Unknown lines are ignored on import for forward
//! compatibility, matching the spec's tolerance policy.

use crate::error::{MeshError, Result};
use crate::identity::DeviceClass;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRecord {
    pub name: String,
    pub device_class: DeviceClass,
    pub ed25519_public_hex: String,
    pub addresses: Vec<String>,
}

impl ExportRecord {
    pub fn to_blob(&self) -> String {
        let mut lines = vec![
            format!("Name {}", self.name),
            format!("DeviceClass {}", device_class_token(self.device_class)),
            format!("Ed25519PublicKey {}", self.ed25519_public_hex),
        ];
        for addr in &self.addresses {
            lines.push(format!("Address {addr}"));
        }
        lines.join("\n")
    }

    pub fn from_blob(blob: &str) -> Result<Self> {
        let mut name = None;
        let mut device_class = None;
        let mut pubkey = None;
        let mut addresses = Vec::new();

        for line in blob.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once(' ') {
                Some(kv) => kv,
                None => continue, // unknown/malformed line: ignored for forward compat
            };
            match key {
                "Name" => name = Some(value.to_string()),
                "DeviceClass" => device_class = Some(parse_device_class(value)?),
                "Ed25519PublicKey" => pubkey = Some(value.to_string()),
                "Address" => addresses.push(value.to_string()),
                _ => {} // forward-compatible: ignore unrecognized lines
            }
        }

        Ok(Self {
            name: name.ok_or_else(|| MeshError::inval("export blob missing Name"))?,
            device_class: device_class
                .ok_or_else(|| MeshError::inval("export blob missing DeviceClass"))?,
            ed25519_public_hex: pubkey
                .ok_or_else(|| MeshError::inval("export blob missing Ed25519PublicKey"))?,
            addresses,
        })
    }
}

fn device_class_token(class: DeviceClass) -> &'static str {
    match class {
        DeviceClass::Backbone => "backbone",
        DeviceClass::Stationary => "stationary",
        DeviceClass::Portable => "portable",
        DeviceClass::Unknown => "unknown",
    }
}

fn parse_device_class(token: &str) -> Result<DeviceClass> {
    match token {
        "backbone" => Ok(DeviceClass::Backbone),
        "stationary" => Ok(DeviceClass::Stationary),
        "portable" => Ok(DeviceClass::Portable),
        "unknown" => Ok(DeviceClass::Unknown),
        other => Err(MeshError::inval(format!("unknown device class {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_byte_for_byte_equivalent() {
        let record = ExportRecord {
            name: "foo".into(),
            device_class: DeviceClass::Backbone,
            ed25519_public_hex: "aabbcc".into(),
            addresses: vec!["198.51.100.4:655".into(), "[2001:db8::1]:655".into()],
        };
        let blob = record.to_blob();
        let parsed = ExportRecord::from_blob(&blob).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn ignores_unknown_lines() {
        let blob = "Name foo\nDeviceClass portable\nEd25519PublicKey ff\nFutureField bar";
        let parsed = ExportRecord::from_blob(blob).unwrap();
        assert_eq!(parsed.name, "foo");
        assert_eq!(parsed.device_class, DeviceClass::Portable);
    }

    #[test]
    fn missing_required_field_errors() {
        assert!(ExportRecord::from_blob("Name foo").is_err());
    }
}
