//! Meta-protocol control lines: ASCII, LF-terminated, whitespace
//! tokenized (§4.C). Hand-rolled rather than serde-tagged because the
//! wire format is text tokens, not JSON — the verb vocabulary plays the
//! same role the donor's `#[serde(tag = "type")]` `MeshMessage` enum
//! does, just framed differently.

use std::fmt;
use std::str::FromStr;

use crate::error::{MeshError, Result};

/// One parsed meta-connection control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaLine {
    /// `ID <name> <device_class> <protocol_version>`
    Id {
        name: String,
        device_class: String,
        protocol_version: u32,
    },
    /// `ACK <ed25519_pub_hex> <x25519_pub_hex>`
    Ack {
        ed25519_pub_hex: String,
        x25519_pub_hex: String,
    },
    Ping,
    Pong,
    /// `ADD_EDGE <from> <to> <host> <port> <options> <weight>`
    AddEdge {
        from: String,
        to: String,
        host: String,
        port: u16,
        options: u32,
        weight: u32,
    },
    /// `DEL_EDGE <from> <to>`
    DelEdge { from: String, to: String },
    /// Reserved but unused by the core — parsed and ignored.
    AddSubnet { node: String, subnet: String },
    DelSubnet { node: String, subnet: String },
    /// `STATUS <text...>`
    Status { text: String },
    /// `ERROR <text...>`
    Error { text: String },
    Termreq,
    /// `REQ_KEY <from> <to>`
    ReqKey { from: String, to: String },
    /// `ANS_KEY <from> <to> <key_hex>`
    AnsKey {
        from: String,
        to: String,
        key_hex: String,
    },
}

impl MetaLine {
    /// True for verbs that are legal to receive on an ACTIVE
    /// meta-connection; an unknown verb on ACTIVE elicits ERROR and
    /// closes, per §4.C. This fn only classifies known verbs — the
    /// unknown case is handled by the caller seeing a parse error.
    pub fn verb(&self) -> &'static str {
        match self {
            MetaLine::Id { .. } => "ID",
            MetaLine::Ack { .. } => "ACK",
            MetaLine::Ping => "PING",
            MetaLine::Pong => "PONG",
            MetaLine::AddEdge { .. } => "ADD_EDGE",
            MetaLine::DelEdge { .. } => "DEL_EDGE",
            MetaLine::AddSubnet { .. } => "ADD_SUBNET",
            MetaLine::DelSubnet { .. } => "DEL_SUBNET",
            MetaLine::Status { .. } => "STATUS",
            MetaLine::Error { .. } => "ERROR",
            MetaLine::Termreq => "TERMREQ",
            MetaLine::ReqKey { .. } => "REQ_KEY",
            MetaLine::AnsKey { .. } => "ANS_KEY",
        }
    }
}

impl fmt::Display for MetaLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaLine::Id {
                name,
                device_class,
                protocol_version,
            } => write!(f, "ID {name} {device_class} {protocol_version}"),
            MetaLine::Ack {
                ed25519_pub_hex,
                x25519_pub_hex,
            } => write!(f, "ACK {ed25519_pub_hex} {x25519_pub_hex}"),
            MetaLine::Ping => write!(f, "PING"),
            MetaLine::Pong => write!(f, "PONG"),
            MetaLine::AddEdge {
                from,
                to,
                host,
                port,
                options,
                weight,
            } => write!(f, "ADD_EDGE {from} {to} {host} {port} {options} {weight}"),
            MetaLine::DelEdge { from, to } => write!(f, "DEL_EDGE {from} {to}"),
            MetaLine::AddSubnet { node, subnet } => write!(f, "ADD_SUBNET {node} {subnet}"),
            MetaLine::DelSubnet { node, subnet } => write!(f, "DEL_SUBNET {node} {subnet}"),
            MetaLine::Status { text } => write!(f, "STATUS {text}"),
            MetaLine::Error { text } => write!(f, "ERROR {text}"),
            MetaLine::Termreq => write!(f, "TERMREQ"),
            MetaLine::ReqKey { from, to } => write!(f, "REQ_KEY {from} {to}"),
            MetaLine::AnsKey { from, to, key_hex } => write!(f, "ANS_KEY {from} {to} {key_hex}"),
        }
    }
}

impl FromStr for MetaLine {
    type Err = MeshError;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut tokens = line.split_whitespace();
        let verb = tokens
            .next()
            .ok_or_else(|| MeshError::inval("empty meta-connection line"))?;

        let rest: Vec<&str> = tokens.collect();
        let bad = |what: &str| MeshError::inval(format!("malformed {verb} line: {what}"));

        match verb {
            "ID" => {
                let [name, device_class, version] = rest[..] else {
                    return Err(bad("expected 3 fields"));
                };
                Ok(MetaLine::Id {
                    name: name.to_string(),
                    device_class: device_class.to_string(),
                    protocol_version: version
                        .parse()
                        .map_err(|_| bad("protocol_version not a u32"))?,
                })
            }
            "ACK" => {
                let [ed, x] = rest[..] else {
                    return Err(bad("expected 2 fields"));
                };
                Ok(MetaLine::Ack {
                    ed25519_pub_hex: ed.to_string(),
                    x25519_pub_hex: x.to_string(),
                })
            }
            "PING" => Ok(MetaLine::Ping),
            "PONG" => Ok(MetaLine::Pong),
            "ADD_EDGE" => {
                let [from, to, host, port, options, weight] = rest[..] else {
                    return Err(bad("expected 6 fields"));
                };
                Ok(MetaLine::AddEdge {
                    from: from.to_string(),
                    to: to.to_string(),
                    host: host.to_string(),
                    port: port.parse().map_err(|_| bad("port not a u16"))?,
                    options: options.parse().map_err(|_| bad("options not a u32"))?,
                    weight: weight.parse().map_err(|_| bad("weight not a u32"))?,
                })
            }
            "DEL_EDGE" => {
                let [from, to] = rest[..] else {
                    return Err(bad("expected 2 fields"));
                };
                Ok(MetaLine::DelEdge {
                    from: from.to_string(),
                    to: to.to_string(),
                })
            }
            "ADD_SUBNET" => {
                let [node, subnet] = rest[..] else {
                    return Err(bad("expected 2 fields"));
                };
                Ok(MetaLine::AddSubnet {
                    node: node.to_string(),
                    subnet: subnet.to_string(),
                })
            }
            "DEL_SUBNET" => {
                let [node, subnet] = rest[..] else {
                    return Err(bad("expected 2 fields"));
                };
                Ok(MetaLine::DelSubnet {
                    node: node.to_string(),
                    subnet: subnet.to_string(),
                })
            }
            "STATUS" => Ok(MetaLine::Status {
                text: rest.join(" "),
            }),
            "ERROR" => Ok(MetaLine::Error {
                text: rest.join(" "),
            }),
            "TERMREQ" => Ok(MetaLine::Termreq),
            "REQ_KEY" => {
                let [from, to] = rest[..] else {
                    return Err(bad("expected 2 fields"));
                };
                Ok(MetaLine::ReqKey {
                    from: from.to_string(),
                    to: to.to_string(),
                })
            }
            "ANS_KEY" => {
                let [from, to, key] = rest[..] else {
                    return Err(bad("expected 3 fields"));
                };
                Ok(MetaLine::AnsKey {
                    from: from.to_string(),
                    to: to.to_string(),
                    key_hex: key.to_string(),
                })
            }
            other => Err(MeshError::inval(format!("unknown meta verb {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_add_edge() {
        let line = MetaLine::AddEdge {
            from: "foo".into(),
            to: "bar".into(),
            host: "10.0.0.1".into(),
            port: 655,
            options: 0,
            weight: 1,
        };
        let text = line.to_string();
        let parsed: MetaLine = text.parse().unwrap();
        assert_eq!(parsed, line);
    }

    #[test]
    fn trims_trailing_newline() {
        let parsed: MetaLine = "PING\n".parse().unwrap();
        assert_eq!(parsed, MetaLine::Ping);
    }

    #[test]
    fn unknown_verb_errors() {
        assert!("FROBNICATE a b".parse::<MetaLine>().is_err());
    }

    #[test]
    fn status_and_error_preserve_remaining_text() {
        let parsed: MetaLine = "ERROR bad signature from peer".parse().unwrap();
        assert_eq!(
            parsed,
            MetaLine::Error {
                text: "bad signature from peer".into()
            }
        );
    }
}
