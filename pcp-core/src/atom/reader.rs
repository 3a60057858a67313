use {
    super::{
        errors::{AtomError, AtomErrorValue},
        Atom, AtomName, HEADER_LENGTH, PARENT_FLAG,
    },
    byteorder::{ByteOrder, LittleEndian},
    bytes::Bytes,
};

/// Bounds applied while parsing untrusted input.
#[derive(Debug, Clone, Copy)]
pub struct ReadLimits {
    pub max_leaf_len: usize,
    pub max_children: usize,
    pub max_depth: usize,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self {
            max_leaf_len: 1024 * 1024,
            max_children: 1024,
            max_depth: 32,
        }
    }
}

/// Extent of the next atom in a buffer, found without copying any value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLen {
    /// The whole atom is present and spans this many bytes.
    Complete(usize),
    /// At least this many bytes from the start are needed before more is known.
    Needs(usize),
}

/// Parses one atom at a time from a byte slice.
///
/// Nothing is consumed on failure: `read` either returns a complete atom with the
/// number of bytes it spans, or an error. `TruncatedInput` means the slice ends
/// inside the atom and more bytes may complete it.
#[derive(Debug, Clone, Default)]
pub struct AtomReader {
    limits: ReadLimits,
}

impl AtomReader {
    #[must_use]
    pub fn new(limits: ReadLimits) -> Self {
        Self { limits }
    }

    #[must_use]
    pub const fn limits(&self) -> &ReadLimits {
        &self.limits
    }

    pub fn read(&self, data: &[u8]) -> Result<(Atom, usize), AtomError> {
        self.read_at_depth(data, 0)
    }

    /// Walk the headers of the next atom and report how far it extends. Limits
    /// are enforced as in [`AtomReader::read`], so a frame reported complete
    /// fails to parse only on the same grounds `read` would.
    pub fn frame_len(&self, data: &[u8]) -> Result<FrameLen, AtomError> {
        self.frame_at(data, 0, 0)
    }

    fn frame_at(&self, data: &[u8], start: usize, depth: usize) -> Result<FrameLen, AtomError> {
        if depth > self.limits.max_depth {
            return Err(AtomErrorValue::TooDeep {
                max: self.limits.max_depth,
            }
            .into());
        }
        let body = start + HEADER_LENGTH;
        if data.len() < body {
            return Ok(FrameLen::Needs(body));
        }
        let (name, length) = read_header(&data[start..body]);

        if length & PARENT_FLAG != 0 {
            let count = self.check_children(name, length)?;
            let mut end = body;
            for _ in 0..count {
                match self.frame_at(data, end, depth + 1)? {
                    FrameLen::Complete(child_end) => end = child_end,
                    needs @ FrameLen::Needs(_) => return Ok(needs),
                }
            }
            Ok(FrameLen::Complete(end))
        } else {
            let end = body + self.check_leaf(name, length)?;
            if data.len() < end {
                Ok(FrameLen::Needs(end))
            } else {
                Ok(FrameLen::Complete(end))
            }
        }
    }

    fn check_children(&self, name: AtomName, length: u32) -> Result<usize, AtomError> {
        let count = (length & !PARENT_FLAG) as usize;
        if count > self.limits.max_children {
            return Err(AtomErrorValue::TooManyChildren {
                name,
                count,
                max: self.limits.max_children,
            }
            .into());
        }
        Ok(count)
    }

    fn check_leaf(&self, name: AtomName, length: u32) -> Result<usize, AtomError> {
        let len = length as usize;
        if len > self.limits.max_leaf_len {
            return Err(AtomErrorValue::LeafTooLarge {
                name,
                len,
                max: self.limits.max_leaf_len,
            }
            .into());
        }
        Ok(len)
    }

    fn read_at_depth(&self, data: &[u8], depth: usize) -> Result<(Atom, usize), AtomError> {
        if depth > self.limits.max_depth {
            return Err(AtomErrorValue::TooDeep {
                max: self.limits.max_depth,
            }
            .into());
        }
        if data.len() < HEADER_LENGTH {
            return Err(AtomErrorValue::TruncatedInput.into());
        }

        let (name, length) = read_header(data);

        if length & PARENT_FLAG != 0 {
            let count = self.check_children(name, length)?;

            let mut offset = HEADER_LENGTH;
            let mut children = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                let (child, used) = self.read_at_depth(&data[offset..], depth + 1)?;
                offset += used;
                children.push(child);
            }
            Ok((Atom::with_children(name, children), offset))
        } else {
            let end = HEADER_LENGTH + self.check_leaf(name, length)?;
            if data.len() < end {
                return Err(AtomErrorValue::TruncatedInput.into());
            }
            let value = Bytes::copy_from_slice(&data[HEADER_LENGTH..end]);
            Ok((Atom::with_value(name, value), end))
        }
    }
}

/// Name and raw length word of the header at the front of `data`.
fn read_header(data: &[u8]) -> (AtomName, u32) {
    let mut name = [0u8; 4];
    name.copy_from_slice(&data[..4]);
    (
        AtomName::from_bytes(name),
        LittleEndian::read_u32(&data[4..HEADER_LENGTH]),
    )
}

/// Decode exactly one atom from the front of `data` with default limits.
pub fn decode(data: &[u8]) -> Result<(Atom, usize), AtomError> {
    AtomReader::default().read(data)
}
