//! `Pack`/`Unpack`: typed values on top of the raw encoder and decoder.
//!
//! Records (structs with named fields) and tagged unions (enums) get their
//! impls from `#[derive(Pack, Unpack)]`. Derived records skip fields they
//! do not know and default fields that are absent, so peers may append
//! fields without breaking older readers.

use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::types::Error;
use crate::types::Result;

/// A value that can be written to an `Encoder` as exactly one item.
pub trait Pack {
    fn pack(&self, enc: &mut Encoder) -> Result<()>;
}

/// A value that can be read back from exactly one item.
pub trait Unpack: Sized {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self>;
}

impl Pack for bool {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { enc.bool(*self) }
}

impl Unpack for bool {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> { dec.bool() }
}

for_each_int!(pack_int);

impl Pack for () {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { enc.unit() }
}

impl Unpack for () {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> { dec.unit() }
}

impl Pack for str {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { enc.str(self) }
}

impl Pack for String {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { enc.str(self) }
}

impl Unpack for String {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> { Ok(dec.str()?.to_owned()) }
}

impl<T: Pack + ?Sized> Pack for &T {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { (**self).pack(enc) }
}

impl<T: Pack + ?Sized> Pack for Box<T> {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { (**self).pack(enc) }
}

impl<T: Unpack> Unpack for Box<T> {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> { Ok(Box::new(T::unpack(dec)?)) }
}

impl<T: Pack> Pack for Option<T> {
    fn pack(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Some(v) => {
                enc.some_begin()?;
                v.pack(enc)?;
                enc.some_end()
            }
            None => enc.none(),
        }
    }
}

impl<T: Unpack> Unpack for Option<T> {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> {
        match dec.option()? {
            Some(mut inner) => Ok(Some(T::unpack(&mut inner)?)),
            None => Ok(None),
        }
    }
}

impl<T: Pack> Pack for [T] {
    fn pack(&self, enc: &mut Encoder) -> Result<()> {
        enc.list_begin()?;
        for item in self {
            item.pack(enc)?;
        }
        enc.list_end()
    }
}

impl<T: Pack> Pack for Vec<T> {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { self.as_slice().pack(enc) }
}

impl<T: Unpack> Unpack for Vec<T> {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut items = dec.list()?;
        let mut out = Vec::new();
        while let Some(mut item) = items.next()? {
            out.push(T::unpack(&mut item)?);
        }
        Ok(out)
    }
}

/// An owned byte blob, encoded as a single `Bytes` item rather than a list
/// of `u8`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteBuf(pub Vec<u8>);

impl ByteBuf {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for ByteBuf {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for ByteBuf {
    fn from(v: &[u8]) -> Self {
        Self(v.to_vec())
    }
}

impl std::ops::Deref for ByteBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl Pack for ByteBuf {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { enc.bytes(&self.0) }
}

impl Unpack for ByteBuf {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> { Ok(Self(dec.bytes()?.to_vec())) }
}

/// Encodes one value into a fresh buffer.
pub fn to_bytes<T: Pack + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    value.pack(&mut enc)?;
    enc.into_bytes()
}

/// Decodes one value that must span the whole buffer.
pub fn from_bytes<T: Unpack>(bytes: &[u8]) -> Result<T> {
    let mut dec = Decoder::new(bytes);
    let value = T::unpack(&mut dec)?;
    dec.finish()?;
    Ok(value)
}

/// Reports an unknown union case. Used by derived `Unpack` impls.
pub fn unknown_variant(name: &str) -> Error {
    Error::UnknownVariant(name.to_owned())
}
