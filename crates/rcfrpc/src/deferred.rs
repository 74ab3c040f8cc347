//! Deferred-call bookkeeping.
//!
//! A handle holds at most one deferred call. A `Deferred` call fills the
//! slot once the server has accepted the request; the matching `Complete`
//! call empties it. While it is full only `is_op_done` and `is_alive` may
//! talk to the server.

use rpcwire::Errno;
use rpcwire::Module;
use rpcwire::TeErrno;
use tracing::debug;

use crate::builtin;
use crate::builtin::IsOpDoneOut;
use crate::server::RpcServer;

/// The deferred call a handle is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    pub jobid: u64,
    pub func: String,
}

impl RpcServer {
    /// The outstanding deferred call, if any.
    pub fn pending(&self) -> Option<Pending> {
        self.lock().deferred.clone()
    }

    /// Asks the server whether the deferred call has finished, without
    /// waiting for it. Fails with `EALREADY` when nothing is pending.
    pub async fn is_op_done(&self) -> Result<bool, TeErrno> {
        let Some(pending) = self.pending() else {
            return Err(TeErrno::new(Module::RcfRpc, Errno::Already));
        };

        let raw = self
            .raw_call::<(), IsOpDoneOut>(builtin::IS_OP_DONE, &(), None, pending.jobid, true)
            .await?;
        self.settle_raw(&raw);

        if !raw.errno.is_ok() {
            return Err(raw.errno);
        }
        debug!("RPC {} {}() is {}done", self, pending.func, if raw.out.done { "" } else { "not " });
        Ok(raw.out.done)
    }
}
