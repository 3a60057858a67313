use super::AtomName;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum AtomErrorValue {
    #[error("truncated input")]
    TruncatedInput,
    #[error("format error: {0}")]
    FormatError(String),
    #[error("leaf atom {name} too large: {len} > {max} max")]
    LeafTooLarge { name: AtomName, len: usize, max: usize },
    #[error("atom {name} has too many children: {count} > {max} max")]
    TooManyChildren { name: AtomName, count: usize, max: usize },
    #[error("atoms nested deeper than {max}")]
    TooDeep { max: usize },
    #[error("atom {0} is a parent, not a value")]
    NotAValue(AtomName),
    #[error("atom {name} has length {actual}, expected {expected}")]
    BadLength {
        name: AtomName,
        expected: usize,
        actual: usize,
    },
    #[error("string atom {0} is not NUL terminated")]
    MissingNul(AtomName),
    #[error("string atom {0} is not valid utf-8")]
    NotUtf8(AtomName),
    #[error("io error: {0}")]
    IO(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct AtomError {
    pub value: AtomErrorValue,
}

impl AtomError {
    /// True when more input could complete the atom.
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        matches!(self.value, AtomErrorValue::TruncatedInput)
    }
}

impl From<AtomErrorValue> for AtomError {
    fn from(val: AtomErrorValue) -> Self {
        Self { value: val }
    }
}

impl From<io::Error> for AtomError {
    fn from(error: io::Error) -> Self {
        Self {
            value: AtomErrorValue::IO(error),
        }
    }
}
