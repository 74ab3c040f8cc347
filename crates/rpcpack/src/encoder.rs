//! The bounded, scope-checked encoder.

use crate::types::Error;
use crate::types::Result;
use crate::types::Scope;
use crate::types::Tag;

/// Byte ceiling used by `Encoder::new`.
pub const DEFAULT_LIMIT: usize = 16 * 1024 * 1024;

/// An open container on the encoder stack.
struct Frame {
    start: usize,
    scope: Scope,
    count: usize,
}

/// A bounded, state-machine driven encoder.
///
/// Keeps a stack of open scopes, rejects structurally invalid writes and
/// back-patches container lengths on close.
///
/// # Structural Invariants
///
/// 1.  **Records**: only `field_begin()` may write directly into a record.
/// 2.  **Single-item scopes** (Field, Some, Union): exactly one item.
/// 3.  **Root**: all scopes must be closed before the bytes are taken.
/// 4.  **Limit**: the buffer never grows past the configured limit.
pub struct Encoder {
    buf: Vec<u8>,
    limit: usize,
    /// Bottom is always `Scope::Root`.
    stack: Vec<Frame>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Creates an encoder limited to `DEFAULT_LIMIT` bytes.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_LIMIT)
    }

    /// Creates an encoder that fails with `Error::BufferFull` past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        let mut stack = Vec::with_capacity(8);
        stack.push(Frame { start: 0, scope: Scope::Root, count: 0 });
        Self {
            buf: Vec::with_capacity(limit.min(1024)),
            limit,
            stack,
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the encoder and returns the final byte vector.
    ///
    /// # Errors
    /// Returns `Error::ScopeStillOpen` if a container is still open.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    /// Returns a view of the finished buffer.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(&self.buf)
    }

    fn current_frame(&mut self) -> &mut Frame {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn reserve(&mut self, n: usize) -> Result<()> {
        if self.buf.len().saturating_add(n) > self.limit {
            return Err(Error::BufferFull { limit: self.limit });
        }
        Ok(())
    }

    fn check_write(&mut self, tag: Tag) -> Result<()> {
        let frame = self.current_frame();
        match frame.scope {
            Scope::Root | Scope::List => Ok(()),
            Scope::Record if tag == Tag::Field => Ok(()),
            Scope::Record => Err(Error::NotAField),
            scope if frame.count >= 1 => Err(Error::TooManyItems(scope)),
            _ => Ok(()),
        }
    }

    pub(crate) fn on_item_written(&mut self) {
        self.current_frame().count += 1;
    }

    /// Writes `tag` after checking there is room for it and `payload` bytes.
    pub(crate) fn write_tag(&mut self, tag: Tag, payload: usize) -> Result<()> {
        self.check_write(tag)?;
        self.reserve(1 + payload)?;
        self.buf.push(tag as u8);
        Ok(())
    }

    fn write_blob(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        let len = data.len();
        if len > u32::MAX as usize {
            return Err(Error::BlobTooLarge(len));
        }
        self.write_tag(tag, 4 + len)?;
        self.buf.extend_from_slice(&(len as u32).to_le_bytes());
        self.buf.extend_from_slice(data);
        self.on_item_written();
        Ok(())
    }

    fn begin_scope(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.write_tag(tag, 4)?;
        self.buf.extend_from_slice(&[0, 0, 0, 0]); // length placeholder
        self.stack.push(Frame {
            start: self.buf.len(),
            scope,
            count: 0,
        });
        Ok(())
    }

    fn end_scope(&mut self, expected: Scope) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Error::ScopeUnderflow);
        }

        let frame = self.current_frame();
        if frame.scope != expected {
            return Err(Error::ScopeMismatch { expected, actual: frame.scope });
        }
        if frame.scope.single_item() && frame.count == 0 {
            return Err(Error::EmptyScope(frame.scope));
        }

        let Some(frame) = self.stack.pop() else {
            return Err(Error::ScopeUnderflow);
        };
        let body_len = self.buf.len() - frame.start;
        if body_len > u32::MAX as usize {
            return Err(Error::BlobTooLarge(body_len));
        }

        let len_pos = frame.start - 4;
        self.buf[len_pos..frame.start].copy_from_slice(&(body_len as u32).to_le_bytes());
        self.on_item_written();
        Ok(())
    }

    /// Encodes a boolean value.
    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.write_tag(if v { Tag::BoolTrue } else { Tag::BoolFalse }, 0)?;
        self.on_item_written();
        Ok(())
    }

    for_each_int!(encode_int);

    /// Encodes Unit `()`, the payload of a payload-less union case.
    pub fn unit(&mut self) -> Result<()> {
        self.write_tag(Tag::Unit, 0)?;
        self.on_item_written();
        Ok(())
    }

    /// Encodes `Option::None`.
    pub fn none(&mut self) -> Result<()> {
        self.write_tag(Tag::None, 0)?;
        self.on_item_written();
        Ok(())
    }

    /// Encodes a length-prefixed UTF-8 string.
    pub fn str(&mut self, v: &str) -> Result<()> {
        self.write_blob(Tag::String, v.as_bytes())
    }

    /// Encodes a length-prefixed byte blob.
    pub fn bytes(&mut self, v: &[u8]) -> Result<()> {
        self.write_blob(Tag::Bytes, v)
    }

    /// Begins a list. Any number of items, closed by `list_end()`.
    pub fn list_begin(&mut self) -> Result<()> { self.begin_scope(Tag::List, Scope::List) }
    /// Ends a list.
    pub fn list_end(&mut self) -> Result<()> { self.end_scope(Scope::List) }

    /// Begins a record.
    ///
    /// # Invariants
    /// - Must be closed via `record_end()`.
    /// - **Strict:** only `field_begin()` is allowed as a direct child.
    pub fn record_begin(&mut self) -> Result<()> { self.begin_scope(Tag::Record, Scope::Record) }
    /// Ends a record.
    pub fn record_end(&mut self) -> Result<()> { self.end_scope(Scope::Record) }

    /// Begins a named field of the enclosing record.
    ///
    /// Exactly one value must be written before `field_end()`.
    pub fn field_begin(&mut self, name: &str) -> Result<()> {
        self.begin_scope(Tag::Field, Scope::Field)?;
        self.str(name)?;
        // the name is metadata; the value is the one counted item
        self.current_frame().count = 0;
        Ok(())
    }
    /// Ends a field.
    pub fn field_end(&mut self) -> Result<()> { self.end_scope(Scope::Field) }

    /// Begins `Option::Some`. Exactly one item.
    pub fn some_begin(&mut self) -> Result<()> { self.begin_scope(Tag::Some, Scope::Some) }
    /// Ends `Option::Some`.
    pub fn some_end(&mut self) -> Result<()> { self.end_scope(Scope::Some) }

    /// Begins the named case of a tagged union. Exactly one item
    /// (`unit()` for payload-less cases).
    pub fn union_begin(&mut self, case: &str) -> Result<()> {
        self.begin_scope(Tag::Union, Scope::Union)?;
        self.str(case)?;
        self.current_frame().count = 0;
        Ok(())
    }
    /// Ends a union case.
    pub fn union_end(&mut self) -> Result<()> { self.end_scope(Scope::Union) }

    /// Copies an already encoded item verbatim into the current scope.
    ///
    /// `raw` must hold exactly one complete item, as produced by another
    /// encoder or sliced out of a decoder.
    pub fn raw(&mut self, raw: &[u8]) -> Result<()> {
        let Some(&first) = raw.first() else {
            return Err(Error::UnexpectedEnd);
        };
        let tag = Tag::from_u8(first).ok_or(Error::InvalidTag(first))?;
        self.check_write(tag)?;
        self.reserve(raw.len())?;
        self.buf.extend_from_slice(raw);
        self.on_item_written();
        Ok(())
    }
}
