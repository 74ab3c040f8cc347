//! # Flag Bitmap Encoding
//!
//! Library-selection flags travel as a compact bitmap rather than a list of
//! names: bit N set means flag N of the table is active.
//!
//! ## Wire Format
//! - Tag: Bytes (0x11)
//! - Length: u32 (number of bytes needed for the bitmap)
//! - Data: Bitmap bytes (bit N set = flag N is active)
//!
//! Bits past the end of the reader's table are ignored, so a newer peer may
//! append flags.

use crate::error::Error;
use crate::error::Result;

use rpcpack::Decoder;
use rpcpack::Encoder;

/// Encodes the active names of `table` as a bitmap.
///
/// # Errors
/// Returns `Error::UnknownVariant` if an active name is not in the table.
pub fn encode_flags_bitmap(enc: &mut Encoder, active: &[&str], table: &[&str]) -> Result<()> {
    let mut bitmap = vec![0u8; table.len().div_ceil(8)];

    for name in active {
        let Some(idx) = table.iter().position(|n| n == name) else {
            return Err(Error::UnknownVariant((*name).to_owned()));
        };
        bitmap[idx / 8] |= 1 << (idx % 8);
    }

    enc.bytes(&bitmap)?;
    Ok(())
}

/// Decodes a bitmap into the active names, in table order.
pub fn decode_flags_bitmap<'t>(dec: &mut Decoder<'_>, table: &[&'t str]) -> Result<Vec<&'t str>> {
    let bitmap = dec.bytes()?;
    let active = table
        .iter()
        .enumerate()
        .filter(|(idx, _)| bitmap.get(idx / 8).is_some_and(|b| b & (1 << (idx % 8)) != 0))
        .map(|(_, name)| *name)
        .collect();
    Ok(active)
}

/// Library selection for one call.
///
/// `use_syscall` is advisory: each remote function decides what it means,
/// if anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LibFlags {
    pub use_libc: bool,
    pub use_syscall: bool,
}

impl LibFlags {
    pub const NAMES: [&'static str; 2] = ["use_libc", "use_syscall"];

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        let mut active = Vec::with_capacity(2);
        if self.use_libc {
            active.push(Self::NAMES[0]);
        }
        if self.use_syscall {
            active.push(Self::NAMES[1]);
        }
        encode_flags_bitmap(enc, &active, &Self::NAMES)
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let active = decode_flags_bitmap(dec, &Self::NAMES)?;
        Ok(Self {
            use_libc: active.contains(&Self::NAMES[0]),
            use_syscall: active.contains(&Self::NAMES[1]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(active: &[&str], table: &[&'static str]) -> Vec<&'static str> {
        let mut enc = Encoder::new();
        encode_flags_bitmap(&mut enc, active, table).unwrap();
        let bytes = enc.into_bytes().unwrap();
        decode_flags_bitmap(&mut Decoder::new(&bytes), table).unwrap()
    }

    #[test]
    fn test_empty_and_single() {
        assert!(roundtrip(&[], &["a", "b", "c"]).is_empty());
        assert_eq!(roundtrip(&["write"], &["read", "write", "exec"]), vec!["write"]);
    }

    #[test]
    fn test_out_of_order_flags_are_normalized() {
        assert_eq!(roundtrip(&["w", "z", "x"], &["z", "y", "x", "w"]), vec!["z", "x", "w"]);
    }

    #[test]
    fn test_bitmap_spans_two_bytes() {
        let table = ["a", "b", "c", "d", "e", "f", "g", "h", "i"];
        let mut enc = Encoder::new();
        encode_flags_bitmap(&mut enc, &["a", "i"], &table).unwrap();
        let bytes = enc.into_bytes().unwrap();
        assert_eq!(Decoder::new(&bytes).bytes().unwrap(), &[0b0000_0001, 0b0000_0001]);
    }

    #[test]
    fn test_unknown_flag_error() {
        let mut enc = Encoder::new();
        match encode_flags_bitmap(&mut enc, &["invalid"], &["valid"]) {
            Err(Error::UnknownVariant(name)) => assert_eq!(name, "invalid"),
            other => panic!("expected UnknownVariant, got {:?}", other),
        }
    }

    #[test]
    fn test_newer_bits_are_ignored() {
        let mut enc = Encoder::new();
        enc.bytes(&[0b1111_1101]).unwrap();
        let bytes = enc.into_bytes().unwrap();
        let flags = LibFlags::decode(&mut Decoder::new(&bytes)).unwrap();
        assert_eq!(flags, LibFlags { use_libc: true, use_syscall: false });
    }
}
