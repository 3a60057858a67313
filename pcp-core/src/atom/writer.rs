use {
    super::{
        errors::{AtomError, AtomErrorValue},
        Atom, AtomContent, MAX_LENGTH, PARENT_FLAG,
    },
    bytes::{BufMut, BytesMut},
};

/// Accumulates encoded atoms until the caller takes the bytes.
#[derive(Debug, Default)]
pub struct AtomWriter {
    bytes: BytesMut,
}

impl AtomWriter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes: BytesMut::new(),
        }
    }

    pub fn write_atom(&mut self, atom: &Atom) -> Result<(), AtomError> {
        write_atom_into(&mut self.bytes, atom)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Take everything written so far, leaving the writer empty.
    pub fn extract_current_bytes(&mut self) -> BytesMut {
        self.bytes.split()
    }
}

/// Append the encoding of `atom` to `dst`.
///
/// Lengths and child counts above 31 bits cannot be represented; the buffer is
/// left untouched when that happens.
pub fn write_atom_into(dst: &mut BytesMut, atom: &Atom) -> Result<(), AtomError> {
    check_lengths(atom)?;
    dst.reserve(atom.encoded_len());
    put_atom(dst, atom);
    Ok(())
}

fn check_lengths(atom: &Atom) -> Result<(), AtomError> {
    let len = match atom.content() {
        AtomContent::Value(value) => value.len(),
        AtomContent::Children(children) => {
            for child in children.iter() {
                check_lengths(child)?;
            }
            children.len()
        }
    };
    if len > MAX_LENGTH as usize {
        return Err(AtomErrorValue::FormatError(format!(
            "atom {} length {len} does not fit in 31 bits",
            atom.name()
        ))
        .into());
    }
    Ok(())
}

fn put_atom(dst: &mut BytesMut, atom: &Atom) {
    dst.put_slice(atom.name().as_bytes());
    match atom.content() {
        AtomContent::Value(value) => {
            dst.put_u32_le(value.len() as u32);
            dst.put_slice(value);
        }
        AtomContent::Children(children) => {
            dst.put_u32_le(PARENT_FLAG | children.len() as u32);
            for child in children.iter() {
                put_atom(dst, child);
            }
        }
    }
}
