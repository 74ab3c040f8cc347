//! Opaque remote pointers.
//!
//! A pointer is meaningful only on the server that produced it. The
//! namespace id names the kind of object it refers to, so two pointers are
//! the same only when both the value and the namespace agree.

use rpcpack::Decoder;
use rpcpack::Encoder;
use rpcpack::Pack;
use rpcpack::Unpack;

/// Namespace id of the default (unnamed) namespace.
pub const NS_DEFAULT: u16 = 0;

/// A `(value, namespace)` pair naming an object on a remote server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RpcPtr {
    pub value: u64,
    pub ns: u16,
}

impl RpcPtr {
    /// Union case name used on the wire, which lets trace printers spot
    /// pointers without knowing the record schema.
    pub const CASE: &'static str = "ptr";

    pub const NULL: RpcPtr = RpcPtr { value: 0, ns: NS_DEFAULT };

    pub const fn new(value: u64, ns: u16) -> Self {
        Self { value, ns }
    }

    pub const fn is_null(&self) -> bool {
        self.value == 0
    }

    /// Reads the payload of a `ptr` union case.
    pub fn from_payload(payload: &mut Decoder<'_>) -> rpcpack::Result<Self> {
        let mut fields = payload.record()?;
        let mut ptr = RpcPtr::NULL;
        while let Some((name, mut value)) = fields.next()? {
            match name {
                "value" => ptr.value = value.u64()?,
                "ns" => ptr.ns = value.u16()?,
                _ => {}
            }
        }
        Ok(ptr)
    }
}

impl Pack for RpcPtr {
    fn pack(&self, enc: &mut Encoder) -> rpcpack::Result<()> {
        enc.union_begin(Self::CASE)?;
        enc.record_begin()?;
        enc.field_begin("value")?;
        enc.u64(self.value)?;
        enc.field_end()?;
        enc.field_begin("ns")?;
        enc.u16(self.ns)?;
        enc.field_end()?;
        enc.record_end()?;
        enc.union_end()
    }
}

impl Unpack for RpcPtr {
    fn unpack(dec: &mut Decoder<'_>) -> rpcpack::Result<Self> {
        let (case, mut payload) = dec.union()?;
        if case != Self::CASE {
            return Err(rpcpack::traits::unknown_variant(case));
        }
        Self::from_payload(&mut payload)
    }
}

impl std::fmt::Display for RpcPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:x})", self.ns, self.value)
    }
}
