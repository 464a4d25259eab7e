//! SMP (Simple Management Protocol) framing
//!
//! Every packet is an 8-byte header followed by a CBOR map:
//!
//! ```text
//! | op | flags | len (BE u16) | group (BE u16) | seq | id |
//! ```

use std::collections::BTreeMap;

use serde_cbor::Value;

use crate::{Error, Result};

/// Header length
pub const HEADER_LEN: usize = 8;

/// Read request
pub const OP_READ: u8 = 0;
/// Read response
pub const OP_READ_RSP: u8 = 1;
/// Write request
pub const OP_WRITE: u8 = 2;
/// Write response
pub const OP_WRITE_RSP: u8 = 3;

/// OS management group
pub const GROUP_OS: u16 = 0;
/// Image management group
pub const GROUP_IMAGE: u16 = 1;

/// `GROUP_OS`: echo
pub const ID_ECHO: u8 = 0;
/// `GROUP_OS`: reset
pub const ID_RESET: u8 = 5;
/// `GROUP_IMAGE`: image state
pub const ID_IMAGE_STATE: u8 = 0;
/// `GROUP_IMAGE`: upload
pub const ID_IMAGE_UPLOAD: u8 = 1;
/// `GROUP_IMAGE`: erase the secondary slot
pub const ID_IMAGE_ERASE: u8 = 5;

/// Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Operation
    pub op: u8,
    /// Flags (unused)
    pub flags: u8,
    /// Body length
    pub len: u16,
    /// Management group
    pub group: u16,
    /// Sequence number
    pub seq: u8,
    /// Command within the group
    pub id: u8,
}

impl Header {
    /// Serialize to wire order
    #[must_use]
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let len = self.len.to_be_bytes();
        let group = self.group.to_be_bytes();
        [self.op, self.flags, len[0], len[1], group[0], group[1], self.seq, self.id]
    }

    /// Parse from the first [`HEADER_LEN`] bytes
    ///
    /// # Errors
    ///
    /// Returns `Transport` if `raw` is too short
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(Error::Transport(format!("short SMP header ({} bytes)", raw.len())));
        }
        Ok(Self {
            op: raw[0],
            flags: raw[1],
            len: u16::from_be_bytes([raw[2], raw[3]]),
            group: u16::from_be_bytes([raw[4], raw[5]]),
            seq: raw[6],
            id: raw[7],
        })
    }
}

/// A request ready to send
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// `OP_READ` or `OP_WRITE`
    pub op: u8,
    /// Management group
    pub group: u16,
    /// Command id
    pub id: u8,
    /// CBOR body
    pub body: BTreeMap<Value, Value>,
}

impl Request {
    /// Request with an empty body
    #[must_use]
    pub const fn new(op: u8, group: u16, id: u8) -> Self {
        Self {
            op,
            group,
            id,
            body: BTreeMap::new(),
        }
    }

    /// Add a body field
    #[must_use]
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.body.insert(Value::Text(key.to_string()), value);
        self
    }

    /// Header plus CBOR body
    ///
    /// # Errors
    ///
    /// Returns `Cbor` if the body cannot be encoded, `Transport` if it is
    /// larger than an SMP packet can carry
    pub fn encode(&self, seq: u8) -> Result<Vec<u8>> {
        let body = serde_cbor::to_vec(&Value::Map(self.body.clone()))?;
        let len = u16::try_from(body.len())
            .map_err(|_| Error::Transport(format!("SMP body too large ({} bytes)", body.len())))?;
        let header = Header {
            op: self.op,
            flags: 0,
            len,
            group: self.group,
            seq,
            id: self.id,
        };

        let mut packet = Vec::with_capacity(HEADER_LEN + body.len());
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(&body);
        Ok(packet)
    }
}

/// A decoded response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Response header
    pub header: Header,
    /// Body fields
    pub body: BTreeMap<Value, Value>,
}

impl Response {
    /// Split a complete packet
    ///
    /// # Errors
    ///
    /// Returns `Transport` for truncated packets, `Cbor` for a malformed body
    pub fn decode(packet: &[u8]) -> Result<Self> {
        let header = Header::parse(packet)?;
        let end = HEADER_LEN + usize::from(header.len);
        if packet.len() < end {
            return Err(Error::Transport(format!(
                "truncated SMP packet: header says {} body bytes, got {}",
                header.len,
                packet.len() - HEADER_LEN
            )));
        }

        let body = if header.len == 0 {
            BTreeMap::new()
        } else {
            match serde_cbor::from_slice(&packet[HEADER_LEN..end])? {
                Value::Map(map) => map,
                other => {
                    return Err(Error::Transport(format!("SMP body is not a map: {other:?}")));
                }
            }
        };
        Ok(Self { header, body })
    }

    /// Body field by name
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(&Value::Text(key.to_string()))
    }

    /// Integer field
    #[must_use]
    pub fn int(&self, key: &str) -> Option<i128> {
        match self.get(key) {
            Some(Value::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    /// MCUmgr return code; absent means OK
    #[must_use]
    pub fn rc(&self) -> i64 {
        self.int("rc").and_then(|v| i64::try_from(v).ok()).unwrap_or(0)
    }

    /// Fail with `Mcumgr` if the return code is not OK
    ///
    /// # Errors
    ///
    /// Returns `Mcumgr { op, rc }` for a non-zero return code
    pub fn check(self, op: &'static str) -> Result<Self> {
        match self.rc() {
            0 => Ok(self),
            rc => Err(Error::Mcumgr { op, rc }),
        }
    }
}

/// Number of bytes still needed to complete a packet starting with `buf`
#[must_use]
pub fn missing_bytes(buf: &[u8]) -> Option<usize> {
    let header = Header::parse(buf).ok()?;
    let total = HEADER_LEN + usize::from(header.len);
    Some(total.saturating_sub(buf.len()))
}

/// Text field of a CBOR map
#[must_use]
pub fn map_text<'a>(map: &'a BTreeMap<Value, Value>, key: &str) -> Option<&'a str> {
    match map.get(&Value::Text(key.to_string())) {
        Some(Value::Text(s)) => Some(s),
        _ => None,
    }
}

/// Byte-string field of a CBOR map
#[must_use]
pub fn map_bytes<'a>(map: &'a BTreeMap<Value, Value>, key: &str) -> Option<&'a [u8]> {
    match map.get(&Value::Text(key.to_string())) {
        Some(Value::Bytes(b)) => Some(b),
        _ => None,
    }
}

/// Boolean field of a CBOR map, `false` when absent
#[must_use]
pub fn map_bool(map: &BTreeMap<Value, Value>, key: &str) -> bool {
    matches!(map.get(&Value::Text(key.to_string())), Some(Value::Bool(true)))
}

/// Integer field of a CBOR map
#[must_use]
pub fn map_int(map: &BTreeMap<Value, Value>, key: &str) -> Option<i128> {
    match map.get(&Value::Text(key.to_string())) {
        Some(Value::Integer(v)) => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = Header {
            op: OP_WRITE,
            flags: 0,
            len: 0x0102,
            group: GROUP_IMAGE,
            seq: 7,
            id: ID_IMAGE_UPLOAD,
        };
        let raw = header.to_bytes();
        assert_eq!(raw, [2, 0, 1, 2, 0, 1, 7, 1]);
        assert_eq!(Header::parse(&raw).unwrap(), header);
    }

    #[test]
    fn test_request_encodes_body_length() {
        let packet = Request::new(OP_WRITE, GROUP_OS, ID_ECHO)
            .with("d", Value::Text("Pong".into()))
            .encode(3)
            .unwrap();
        let header = Header::parse(&packet).unwrap();
        assert_eq!(usize::from(header.len), packet.len() - HEADER_LEN);
        assert_eq!(header.seq, 3);
        assert_eq!(missing_bytes(&packet), Some(0));
        assert_eq!(missing_bytes(&packet[..HEADER_LEN]), Some(usize::from(header.len)));
    }

    #[test]
    fn test_response_rc() {
        let mut body = BTreeMap::new();
        body.insert(Value::Text("rc".into()), Value::Integer(3));
        let packet = Request {
            op: OP_WRITE_RSP,
            group: GROUP_IMAGE,
            id: ID_IMAGE_STATE,
            body,
        }
        .encode(0)
        .unwrap();

        let response = Response::decode(&packet).unwrap();
        assert_eq!(response.rc(), 3);
        let err = response.check("Confirming new image").unwrap_err();
        assert_eq!(err.to_string(), "Confirming new image failed (err: NMP err 3)");
    }

    #[test]
    fn test_truncated_packet() {
        let packet = Request::new(OP_READ, GROUP_IMAGE, ID_IMAGE_STATE)
            .with("x", Value::Integer(1))
            .encode(0)
            .unwrap();
        assert!(Response::decode(&packet[..packet.len() - 1]).is_err());
        assert!(Header::parse(&packet[..4]).is_err());
    }
}
