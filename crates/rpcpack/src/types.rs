//! Wire tags, encoder scopes and the codec error type.

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The encoder's byte limit would be exceeded.
    BufferFull { limit: usize },
    /// Byte does not correspond to a valid `Tag`.
    InvalidTag(u8),
    /// A tag was valid but not the one the reader asked for.
    UnexpectedTag { expected: Tag, found: Tag },
    /// String data is not valid UTF-8.
    InvalidUtf8,
    /// Closing a scope that does not match the active scope stack.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// Attempted to close a scope when only the root remains.
    ScopeUnderflow,
    /// Attempted to finalize the buffer with open scopes.
    ScopeStillOpen,
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// Blob or container length exceeds `u32::MAX`.
    BlobTooLarge(usize),
    /// More than one item written into a single-item scope (Some/Field/Union).
    TooManyItems(Scope),
    /// A single-item scope was closed without its item.
    EmptyScope(Scope),
    /// Only fields may be written directly into a record.
    NotAField,
    /// A union carried a case name the reader does not know.
    UnknownVariant(String),
    /// Containers nested deeper than the renderer follows.
    TooDeep { limit: usize },
    /// Bytes were left over after a top-level value.
    TrailingBytes(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BufferFull { limit } => write!(f, "encoder limit of {} bytes exceeded", limit),
            Error::InvalidTag(b) => write!(f, "invalid tag byte: {:#04x}", b),
            Error::UnexpectedTag { expected, found } => {
                write!(f, "expected {:?}, found {:?}", expected, found)
            }
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "scope mismatch: expected {:?}, found {:?}", expected, actual)
            }
            Error::TooManyItems(s) => write!(f, "too many items in {:?} scope; expected exactly 1", s),
            Error::EmptyScope(s) => write!(f, "empty {:?} scope; expected exactly 1 item", s),
            Error::UnknownVariant(name) => write!(f, "unknown union case '{}'", name),
            Error::TrailingBytes(n) => write!(f, "{} trailing bytes after value", n),
            Error::TooDeep { limit } => write!(f, "nesting deeper than {} levels", limit),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies the kind of the encoded value.
///
/// Every item carries its tag, which is what lets a reader skip fields it
/// does not know about.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    // Fixed-width scalars: [Tag][Data: N]
    BoolTrue = 0x01,
    BoolFalse = 0x02,
    U8 = 0x03,
    U16 = 0x04,
    U32 = 0x05,
    U64 = 0x06,
    S8 = 0x07,
    S16 = 0x08,
    S32 = 0x09,
    S64 = 0x0A,

    // Payload-less markers: [Tag]
    Unit = 0x0E,
    None = 0x0F,

    // Blobs: [Tag][Len: u32][Data: Len]
    String = 0x10,
    Bytes = 0x11,

    // Containers: [Tag][Len: u32][Body: Len]
    List = 0x20,
    Record = 0x21,
    Field = 0x22,
    Some = 0x30,
    Union = 0x33,
}

impl Tag {
    /// Returns the tag for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Tag::BoolTrue),
            0x02 => Some(Tag::BoolFalse),
            0x03 => Some(Tag::U8),
            0x04 => Some(Tag::U16),
            0x05 => Some(Tag::U32),
            0x06 => Some(Tag::U64),
            0x07 => Some(Tag::S8),
            0x08 => Some(Tag::S16),
            0x09 => Some(Tag::S32),
            0x0A => Some(Tag::S64),
            0x0E => Some(Tag::Unit),
            0x0F => Some(Tag::None),
            0x10 => Some(Tag::String),
            0x11 => Some(Tag::Bytes),
            0x20 => Some(Tag::List),
            0x21 => Some(Tag::Record),
            0x22 => Some(Tag::Field),
            0x30 => Some(Tag::Some),
            0x33 => Some(Tag::Union),
            _ => None,
        }
    }

    /// Size of the fixed payload following the tag, or `None` for
    /// length-prefixed items.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Tag::BoolTrue | Tag::BoolFalse | Tag::Unit | Tag::None => Some(0),
            Tag::U8 | Tag::S8 => Some(1),
            Tag::U16 | Tag::S16 => Some(2),
            Tag::U32 | Tag::S32 => Some(4),
            Tag::U64 | Tag::S64 => Some(8),
            Tag::String | Tag::Bytes | Tag::List | Tag::Record | Tag::Field | Tag::Some | Tag::Union => None,
        }
    }
}

/// Open container kinds on the `Encoder` stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The virtual root; allows any item.
    Root,
    /// Ordered sequence; allows any number of items.
    List,
    /// Named field container; allows only `Tag::Field` items.
    Record,
    /// One named value inside a record; exactly one item.
    Field,
    /// `Option::Some`; exactly one item.
    Some,
    /// Named case of a tagged union; exactly one item.
    Union,
}

impl Scope {
    pub(crate) fn single_item(self) -> bool {
        matches!(self, Scope::Field | Scope::Some | Scope::Union)
    }
}
