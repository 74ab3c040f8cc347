//! Procedures the runtime issues on its own behalf, with their records.
//!
//! Every RPC server understands these, whatever library it wraps.

use rpcpack::Pack;
use rpcpack::Unpack;

pub const IS_OP_DONE: &str = "rpc_is_op_done";
pub const IS_ALIVE: &str = "rpc_is_alive";
pub const GETPID: &str = "getpid";
pub const NAMESPACE_ID2STR: &str = "namespace_id2str";
pub const SETLIBNAME: &str = "setlibname";
pub const EXECVE: &str = "execve";
pub const CREATE_PROCESS: &str = "create_process";

/// Procedures that may run while a deferred call is pending. Namespace
/// lookups have no side effects on the server.
pub fn exempt_from_pending(func: &str) -> bool {
    func == IS_OP_DONE || func == IS_ALIVE || func == NAMESPACE_ID2STR
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Pack, Unpack)]
pub struct IsOpDoneOut {
    pub done: bool,
}

/// Output of procedures that only report a C-style return code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Pack, Unpack)]
pub struct RetvalOut {
    pub retval: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Pack, Unpack)]
pub struct NamespaceIn {
    pub id: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Pack, Unpack)]
pub struct NamespaceOut {
    pub retval: i32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Pack, Unpack)]
pub struct SetlibnameIn {
    /// `None` selects the library the server was started with.
    pub libname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Pack, Unpack)]
pub struct ExecveIn {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Pack, Unpack)]
pub struct CreateProcessIn {
    pub name: String,
    pub flags: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Pack, Unpack)]
pub struct CreateProcessOut {
    pub pid: i32,
}
