use {
    super::{
        errors::AtomError, reader::ReadLimits, writer::write_atom_into, Atom, AtomReader,
        FrameLen,
    },
    bytes::{Buf, BytesMut},
    tokio_util::codec::{Decoder, Encoder},
};

/// Streaming framing for a connection's atom stream.
///
/// `decode` yields `None` while the buffer holds only part of the next atom; any
/// other parse failure means the stream framing is lost. Headers are walked
/// first and the atom is parsed once, after all of its bytes have arrived.
#[derive(Debug, Clone, Default)]
pub struct AtomCodec {
    reader: AtomReader,
    /// Buffer length below which the pending atom cannot be complete.
    needed: usize,
}

impl AtomCodec {
    #[must_use]
    pub fn new(limits: ReadLimits) -> Self {
        Self {
            reader: AtomReader::new(limits),
            needed: 0,
        }
    }
}

impl Decoder for AtomCodec {
    type Item = Atom;
    type Error = AtomError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Atom>, AtomError> {
        if src.len() < self.needed {
            return Ok(None);
        }
        match self.reader.frame_len(src)? {
            FrameLen::Needs(needed) => {
                self.needed = needed;
                src.reserve(needed - src.len());
                Ok(None)
            }
            FrameLen::Complete(len) => {
                self.needed = 0;
                let (atom, used) = self.reader.read(&src[..len])?;
                src.advance(used);
                Ok(Some(atom))
            }
        }
    }
}

impl Encoder<Atom> for AtomCodec {
    type Error = AtomError;

    fn encode(&mut self, item: Atom, dst: &mut BytesMut) -> Result<(), AtomError> {
        write_atom_into(dst, &item)
    }
}

impl Encoder<&Atom> for AtomCodec {
    type Error = AtomError;

    fn encode(&mut self, item: &Atom, dst: &mut BytesMut) -> Result<(), AtomError> {
        write_atom_into(dst, item)
    }
}
