//! Call modes.

use rpcpack::Pack;
use rpcpack::Unpack;

/// How one call interacts with the RPC server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pack, Unpack)]
pub enum CallMode {
    /// Send the request and wait for the reply.
    #[default]
    Immediate,
    /// Send the request and return once the server has accepted it.
    Deferred,
    /// Send nothing new; wait for the deferred call on the same server.
    Complete,
}

impl CallMode {
    /// The suffix appended to `RPC (agent,server)` in trace lines.
    pub fn trace_suffix(self) -> &'static str {
        match self {
            CallMode::Immediate => "",
            CallMode::Deferred => " call",
            CallMode::Complete => " wait",
        }
    }
}
