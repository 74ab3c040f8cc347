//! # rpcwire
//!
//! The wire vocabulary shared by the engine and the agents: call and reply
//! frames with their common headers, call modes, library-selection flags,
//! opaque remote pointers and the module-coded errno space.
//!
//! ## Architecture
//!
//! Everything here is built on `rpcpack` records. Headers are records of
//! named fields, so either side may add fields without breaking the other;
//! argument and result records are carried as opaque encoded items and only
//! interpreted by the code that knows their schema.

pub mod errno;
pub mod error;
pub mod flag;
pub mod frame;
pub mod mode;
pub mod ptr;


pub use errno::Errno;
pub use errno::Module;
pub use errno::TeErrno;
pub use error::Error;
pub use error::Result;
pub use flag::LibFlags;
pub use frame::CallDecoder;
pub use frame::CallEncoder;
pub use frame::CallHeader;
pub use frame::ReplyDecoder;
pub use frame::ReplyEncoder;
pub use frame::ReplyHeader;
pub use frame::RpcFrame;
pub use mode::CallMode;
pub use ptr::RpcPtr;
