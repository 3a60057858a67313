//! PCP atoms: a 4-byte name followed by either a byte payload or child atoms.
//!
//! Wire layout of a single atom (all integers little-endian):
//!
//! ```text
//! +----------+----------------------------+------------------------------+
//! | name [4] | length [4]                 | payload                      |
//! +----------+----------------------------+------------------------------+
//!              bit 31 clear: byte length    raw bytes
//!              bit 31 set:   child count    child atoms, encoded in order
//! ```

pub mod codec;
pub mod define;
pub mod errors;
pub mod reader;
pub mod writer;

use {
    crate::utils::Guid,
    byteorder::{ByteOrder, LittleEndian},
    bytes::Bytes,
    errors::{AtomError, AtomErrorValue},
    std::{
        fmt,
        net::{IpAddr, Ipv4Addr, Ipv6Addr},
        sync::Arc,
    },
};

pub use codec::AtomCodec;
pub use reader::{AtomReader, FrameLen, ReadLimits};
pub use writer::AtomWriter;

/// Set in the length field when the atom carries children instead of bytes.
pub const PARENT_FLAG: u32 = 0x8000_0000;
/// Largest byte length or child count expressible in the length field.
pub const MAX_LENGTH: u32 = 0x7FFF_FFFF;
/// Size of the name and length fields.
pub const HEADER_LENGTH: usize = 8;

/// Four ASCII bytes, right padded with NUL.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomName([u8; 4]);

impl AtomName {
    /// Names longer than four bytes are truncated, shorter ones padded with NUL.
    #[must_use]
    pub const fn new(name: &[u8]) -> Self {
        let mut bytes = [0u8; 4];
        let mut i = 0;
        while i < 4 && i < name.len() {
            bytes[i] = name[i];
            i += 1;
        }
        Self(bytes)
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for AtomName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let end = self.0.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]).escape_debug())
    }
}

impl fmt::Debug for AtomName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "'{self}'")
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum AtomContent {
    Value(Bytes),
    /// Shared so that fanning one atom out to many connections never copies the tree.
    Children(Arc<[Atom]>),
}

/// One node of a PCP message tree. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Atom {
    name: AtomName,
    content: AtomContent,
}

impl Atom {
    pub fn with_value(name: AtomName, value: impl Into<Bytes>) -> Self {
        Self {
            name,
            content: AtomContent::Value(value.into()),
        }
    }

    #[must_use]
    pub fn with_children(name: AtomName, children: Vec<Self>) -> Self {
        Self {
            name,
            content: AtomContent::Children(children.into()),
        }
    }

    #[must_use]
    pub fn with_u8(name: AtomName, value: u8) -> Self {
        Self::with_value(name, vec![value])
    }

    #[must_use]
    pub fn with_u16(name: AtomName, value: u16) -> Self {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        Self::with_value(name, buf.to_vec())
    }

    #[must_use]
    pub fn with_u32(name: AtomName, value: u32) -> Self {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        Self::with_value(name, buf.to_vec())
    }

    /// UTF-8 bytes followed by the terminating NUL.
    #[must_use]
    pub fn with_string(name: AtomName, value: &str) -> Self {
        let mut buf = Vec::with_capacity(value.len() + 1);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
        Self::with_value(name, buf)
    }

    #[must_use]
    pub fn with_id(name: AtomName, id: Guid) -> Self {
        Self::with_value(name, id.as_bytes().to_vec())
    }

    /// Addresses travel byte-reversed, like every other little-endian integer.
    #[must_use]
    pub fn with_ip(name: AtomName, ip: IpAddr) -> Self {
        let mut buf = match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        buf.reverse();
        Self::with_value(name, buf)
    }

    #[must_use]
    pub const fn name(&self) -> AtomName {
        self.name
    }

    #[must_use]
    pub const fn content(&self) -> &AtomContent {
        &self.content
    }

    #[must_use]
    pub const fn has_value(&self) -> bool {
        matches!(self.content, AtomContent::Value(_))
    }

    #[must_use]
    pub const fn has_children(&self) -> bool {
        matches!(self.content, AtomContent::Children(_))
    }

    #[must_use]
    pub const fn value(&self) -> Option<&Bytes> {
        match &self.content {
            AtomContent::Value(value) => Some(value),
            AtomContent::Children(_) => None,
        }
    }

    /// Children in wire order; empty for a value atom.
    #[must_use]
    pub fn children(&self) -> &[Self] {
        match &self.content {
            AtomContent::Value(_) => &[],
            AtomContent::Children(children) => children,
        }
    }

    /// First child with the given name.
    #[must_use]
    pub fn child(&self, name: AtomName) -> Option<&Self> {
        self.children().iter().find(|c| c.name == name)
    }

    /// Bytes this atom occupies once encoded, header included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_LENGTH
            + match &self.content {
                AtomContent::Value(value) => value.len(),
                AtomContent::Children(children) => {
                    children.iter().map(Self::encoded_len).sum::<usize>()
                }
            }
    }

    pub fn as_bytes(&self) -> Result<&Bytes, AtomError> {
        self.value()
            .ok_or_else(|| AtomErrorValue::NotAValue(self.name).into())
    }

    fn fixed(&self, expected: usize) -> Result<&Bytes, AtomError> {
        let value = self.as_bytes()?;
        if value.len() != expected {
            return Err(AtomErrorValue::BadLength {
                name: self.name,
                expected,
                actual: value.len(),
            }
            .into());
        }
        Ok(value)
    }

    pub fn as_u8(&self) -> Result<u8, AtomError> {
        Ok(self.fixed(1)?[0])
    }

    pub fn as_u16(&self) -> Result<u16, AtomError> {
        Ok(LittleEndian::read_u16(self.fixed(2)?))
    }

    pub fn as_u32(&self) -> Result<u32, AtomError> {
        Ok(LittleEndian::read_u32(self.fixed(4)?))
    }

    /// Text up to the first NUL; the payload must end with one.
    pub fn as_string(&self) -> Result<String, AtomError> {
        let value = self.as_bytes()?;
        if value.last() != Some(&0) {
            return Err(AtomErrorValue::MissingNul(self.name).into());
        }
        let end = value.iter().position(|b| *b == 0).unwrap_or(value.len());
        String::from_utf8(value[..end].to_vec())
            .map_err(|_| AtomErrorValue::NotUtf8(self.name).into())
    }

    pub fn as_id(&self) -> Result<Guid, AtomError> {
        let value = self.fixed(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(value);
        Ok(Guid::from_bytes(bytes))
    }

    pub fn as_ip(&self) -> Result<IpAddr, AtomError> {
        let value = self.as_bytes()?;
        match value.len() {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(value);
                octets.reverse();
                Ok(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(value);
                octets.reverse();
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            actual => Err(AtomErrorValue::BadLength {
                name: self.name,
                expected: 4,
                actual,
            }
            .into()),
        }
    }

    #[must_use]
    pub fn get_bytes(&self, name: AtomName) -> Option<&Bytes> {
        self.child(name)?.value()
    }

    #[must_use]
    pub fn get_u8(&self, name: AtomName) -> Option<u8> {
        self.child(name)?.as_u8().ok()
    }

    #[must_use]
    pub fn get_u16(&self, name: AtomName) -> Option<u16> {
        self.child(name)?.as_u16().ok()
    }

    #[must_use]
    pub fn get_u32(&self, name: AtomName) -> Option<u32> {
        self.child(name)?.as_u32().ok()
    }

    #[must_use]
    pub fn get_string(&self, name: AtomName) -> Option<String> {
        self.child(name)?.as_string().ok()
    }

    #[must_use]
    pub fn get_id(&self, name: AtomName) -> Option<Guid> {
        self.child(name)?.as_id().ok()
    }

    #[must_use]
    pub fn get_ip(&self, name: AtomName) -> Option<IpAddr> {
        self.child(name)?.as_ip().ok()
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes, AtomError> {
        let mut writer = AtomWriter::new();
        writer.write_atom(self)?;
        Ok(writer.extract_current_bytes().freeze())
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.content {
            AtomContent::Value(value) => write!(f, "{:?}[{} bytes]", self.name, value.len()),
            AtomContent::Children(children) => f
                .debug_map()
                .entry(&self.name, &children.iter().collect::<Vec<_>>())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::define::name;
    use super::*;

    #[test]
    fn test_name_padding_and_truncation() {
        assert_eq!(AtomName::new(b"ok").as_bytes(), b"ok\0\0");
        assert_eq!(AtomName::new(b"helo").as_bytes(), b"helo");
        assert_eq!(AtomName::new(b"toolong").as_bytes(), b"tool");
        assert_eq!(AtomName::new(b"ok").to_string(), "ok");
        assert_eq!(name::CONNECT.to_string(), "pcp\\n");
    }

    #[test]
    fn test_integers_are_little_endian() {
        let atom = Atom::with_u32(name::QUIT, 1003);
        assert_eq!(atom.value().unwrap().as_ref(), &[0xEB, 0x03, 0, 0]);
        assert_eq!(atom.as_u32().unwrap(), 1003);

        let port = Atom::with_u16(name::HELO_PORT, 7144);
        assert_eq!(port.value().unwrap().as_ref(), &[0xE8, 0x1B]);
        assert_eq!(port.as_u16().unwrap(), 7144);
    }

    #[test]
    fn test_string_requires_nul() {
        let atom = Atom::with_string(name::HELO_AGENT, "agent");
        assert_eq!(atom.value().unwrap().as_ref(), b"agent\0");
        assert_eq!(atom.as_string().unwrap(), "agent");

        let missing = Atom::with_value(name::HELO_AGENT, b"agent".to_vec());
        assert!(matches!(
            missing.as_string().unwrap_err().value,
            AtomErrorValue::MissingNul(_)
        ));
    }

    #[test]
    fn test_ip_is_reversed() {
        let ip: IpAddr = "192.168.1.2".parse().unwrap();
        let atom = Atom::with_ip(name::HOST_IP, ip);
        assert_eq!(atom.value().unwrap().as_ref(), &[2, 1, 168, 192]);
        assert_eq!(atom.as_ip().unwrap(), ip);

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(Atom::with_ip(name::HOST_IP, v6).as_ip().unwrap(), v6);
    }

    #[test]
    fn test_typed_getters() {
        let id = Guid::new();
        let helo = Atom::with_children(
            name::HELO,
            vec![
                Atom::with_string(name::HELO_AGENT, "x"),
                Atom::with_id(name::HELO_SESSION_ID, id),
                Atom::with_u16(name::HELO_PORT, 7144),
            ],
        );
        assert!(helo.has_children());
        assert_eq!(helo.get_id(name::HELO_SESSION_ID), Some(id));
        assert_eq!(helo.get_u16(name::HELO_PORT), Some(7144));
        // wrong width is rejected rather than reinterpreted
        assert_eq!(helo.get_u32(name::HELO_PORT), None);
        assert_eq!(helo.get_u16(name::HELO_PING), None);
        assert!(helo.as_bytes().is_err());
    }

    #[test]
    fn test_encoded_len() {
        let atom = Atom::with_children(
            name::CHAN,
            vec![
                Atom::with_u32(name::CHAN_PKT_POS, 1),
                Atom::with_children(name::CHAN_PKT, vec![]),
            ],
        );
        assert_eq!(atom.encoded_len(), 8 + 12 + 8);
        assert_eq!(atom.encode().unwrap().len(), atom.encoded_len());
    }
}
