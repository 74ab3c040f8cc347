//! # rpcpack
//!
//! Bounded TLV records for marshalling RPC arguments and results.
//!
//! ## Philosophy
//!
//! - **Self-describing**: every item is `[Tag][Length?][Value]`, so a reader
//!   can skip what it does not understand.
//! - **Evolvable**: records are lists of named fields. Unknown fields are
//!   skipped and absent ones take their default, which lets engines and
//!   agents of different ages talk to each other.
//! - **Bounded**: encoders refuse to grow past a byte limit; decoders are
//!   zero-copy, bounds-checked views.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b][Data: N]`
//! - **Blobs**: `[Tag: 1b][Len: 4b][Data: Len]`
//! - **Containers**: `[Tag: 1b][Len: 4b][Body: Len]`
//!
//! All integers are Little-Endian regardless of host.

// derived impls name `::rpcpack`, which must also resolve inside this crate
extern crate self as rpcpack;

#[macro_use]
mod macros;

pub mod decoder;
pub mod encoder;
pub mod render;
pub mod traits;
pub mod types;

#[cfg(test)]
mod tests;

pub use decoder::Decoder;
pub use decoder::FieldIter;
pub use decoder::ListIter;
pub use encoder::Encoder;
pub use traits::ByteBuf;
pub use traits::Pack;
pub use traits::Unpack;
pub use traits::from_bytes;
pub use traits::to_bytes;
pub use types::Error;
pub use types::Result;
pub use types::Scope;
pub use types::Tag;

#[cfg(feature = "derive")]
pub use rpcpack_derive::Pack;
#[cfg(feature = "derive")]
pub use rpcpack_derive::Unpack;
