//! Integer plumbing shared by the encoder, decoder and trait impls.

/// Calls `$m!` once per fixed-width integer supported on the wire.
/// Arguments passed to the callback:
/// 1. Method name
/// 2. Rust type
/// 3. Tag variant
macro_rules! for_each_int {
    ($m:ident) => {
        $m!(u8,  u8,  crate::types::Tag::U8);
        $m!(u16, u16, crate::types::Tag::U16);
        $m!(u32, u32, crate::types::Tag::U32);
        $m!(u64, u64, crate::types::Tag::U64);
        $m!(i8,  i8,  crate::types::Tag::S8);
        $m!(i16, i16, crate::types::Tag::S16);
        $m!(i32, i32, crate::types::Tag::S32);
        $m!(i64, i64, crate::types::Tag::S64);
    };
}

/// Generates `Encoder::$name(v)` writing `[Tag][LE bytes]`.
macro_rules! encode_int {
    ($name:ident, $ty:ty, $tag:expr) => {
        #[doc = concat!("Encodes a `", stringify!($ty), "` (LE).")]
        pub fn $name(&mut self, v: $ty) -> crate::types::Result<()> {
            self.write_tag($tag, std::mem::size_of::<$ty>())?;
            self.buf.extend_from_slice(&v.to_le_bytes());
            self.on_item_written();
            Ok(())
        }
    };
}

/// Generates `Decoder::$name()` reading `[Tag][LE bytes]`.
macro_rules! decode_int {
    ($name:ident, $ty:ty, $tag:expr) => {
        #[doc = concat!("Decodes a `", stringify!($ty), "` (LE).")]
        pub fn $name(&mut self) -> crate::types::Result<$ty> {
            self.expect_tag($tag)?;
            let raw = self.read_array::<{ std::mem::size_of::<$ty>() }>()?;
            Ok(<$ty>::from_le_bytes(raw))
        }
    };
}

/// Generates `Pack`/`Unpack` for an integer type.
macro_rules! pack_int {
    ($name:ident, $ty:ty, $tag:expr) => {
        impl crate::traits::Pack for $ty {
            fn pack(&self, enc: &mut crate::encoder::Encoder) -> crate::types::Result<()> {
                enc.$name(*self)
            }
        }

        impl crate::traits::Unpack for $ty {
            fn unpack(dec: &mut crate::decoder::Decoder<'_>) -> crate::types::Result<Self> {
                dec.$name()
            }
        }
    };
}
