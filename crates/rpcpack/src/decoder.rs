//! Zero-copy, bounds-checked reading.

use crate::types::Error;
use crate::types::Result;
use crate::types::Tag;

/// A zero-copy, bounds-checked cursor over a byte slice.
///
/// Reading advances the cursor. Container reads return new decoders
/// restricted to the container's body, so a malformed child can never read
/// past its parent.
///
/// # Errors
/// All read operations return `Error::UnexpectedEnd` if the buffer is exhausted.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over the slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the unread bytes without consuming them.
    pub fn as_slice(&self) -> &'a [u8] {
        self.buf
    }

    /// Peeks the next tag without advancing.
    pub fn peek_tag(&self) -> Result<Tag> {
        let Some(&b) = self.buf.first() else {
            return Err(Error::UnexpectedEnd);
        };
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn consume(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_len(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?) as usize)
    }

    pub(crate) fn expect_tag(&mut self, expected: Tag) -> Result<()> {
        let found = self.peek_tag()?;
        if found != expected {
            return Err(Error::UnexpectedTag { expected, found });
        }
        self.consume(1)
    }

    /// Skips the next item, including any nested children.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.consume(1)?;
        match tag.fixed_width() {
            Some(n) => self.consume(n),
            None => {
                let len = self.read_len()?;
                self.consume(len)
            }
        }
    }

    /// Splits off the next complete item, tag included, and advances past it.
    pub fn next_raw(&mut self) -> Result<&'a [u8]> {
        let mut probe = self.clone();
        probe.skip()?;
        let len = self.remaining() - probe.remaining();
        self.read_bytes(len)
    }

    /// Decodes a bool.
    pub fn bool(&mut self) -> Result<bool> {
        match self.peek_tag()? {
            Tag::BoolTrue => { self.consume(1)?; Ok(true) }
            Tag::BoolFalse => { self.consume(1)?; Ok(false) }
            found => Err(Error::UnexpectedTag { expected: Tag::BoolTrue, found }),
        }
    }

    for_each_int!(decode_int);

    /// Decodes Unit `()`.
    pub fn unit(&mut self) -> Result<()> { self.expect_tag(Tag::Unit) }

    /// Decodes a string slice (UTF-8).
    pub fn str(&mut self) -> Result<&'a str> {
        self.expect_tag(Tag::String)?;
        let len = self.read_len()?;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    /// Decodes a byte slice.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        self.expect_tag(Tag::Bytes)?;
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    fn enter(&mut self, expected: Tag) -> Result<Decoder<'a>> {
        self.expect_tag(expected)?;
        let len = self.read_len()?;
        Ok(Decoder::new(self.read_bytes(len)?))
    }

    /// Decodes a list into an item iterator.
    pub fn list(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.enter(Tag::List)? })
    }

    /// Decodes a record into a field iterator.
    pub fn record(&mut self) -> Result<FieldIter<'a>> {
        Ok(FieldIter { dec: self.enter(Tag::Record)? })
    }

    /// Decodes an option: `Some(payload)` or `None`.
    pub fn option(&mut self) -> Result<Option<Decoder<'a>>> {
        match self.peek_tag()? {
            Tag::None => { self.consume(1)?; Ok(None) }
            Tag::Some => Ok(Some(self.enter(Tag::Some)?)),
            found => Err(Error::UnexpectedTag { expected: Tag::Some, found }),
        }
    }

    /// Decodes a tagged union case as `(case name, payload decoder)`.
    pub fn union(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.enter(Tag::Union)?;
        let name = inner.str()?;
        Ok((name, inner))
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(Error::TrailingBytes(n)),
        }
    }
}

/// Iterator over the items of a list.
#[derive(Debug, Clone)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    /// Returns a decoder positioned on the next item, or `None` at the end.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.dec.is_empty() {
            return Ok(None);
        }
        Ok(Some(Decoder::new(self.dec.next_raw()?)))
    }
}

/// Iterator over the `(name, value)` fields of a record.
#[derive(Debug, Clone)]
pub struct FieldIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> FieldIter<'a> {
    /// Returns the next field name and a decoder positioned on its value.
    pub fn next(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.dec.is_empty() {
            return Ok(None);
        }
        let mut body = self.dec.enter(Tag::Field)?;
        let name = body.str()?;
        Ok(Some((name, body)))
    }
}
