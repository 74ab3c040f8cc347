//! Reuse of expensive remote runtime initialisation.
//!
//! Some libraries under test take long to initialise and can only be
//! initialised once per process. The arguments of the last initialisation
//! are kept at `/agent:<ta>/rpcserver:<name>/config:`. When the engine's
//! reuse flag is set and the arguments did not change, initialisation is
//! skipped; otherwise a server that was initialised before is restarted
//! first.

use std::future::Future;

use rpcwire::TeErrno;
use tracing::info;

use crate::conf;
use crate::server::RpcServer;

/// Runs `init` unless the server already runs with `args`.
///
/// Returns `Ok(true)` if `init` ran and `Ok(false)` if it was skipped.
pub async fn init_or_reuse<F, Fut>(rpcs: &RpcServer, args: &[&str], init: F) -> Result<bool, TeErrno>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), TeErrno>>,
{
    let text = args.join(" ");
    let key = conf::server_leaf(rpcs.agent(), rpcs.name(), "config");
    let current = rpcs.engine().conf().get(&key).await?.unwrap_or_default();

    if rpcs.engine().config().reuse_init && !current.is_empty() && current == text {
        info!("RPC server {} is already initialised with '{}', reusing it", rpcs, text);
        return Ok(false);
    }
    if !current.is_empty() {
        info!("RPC server {} was initialised with '{}', restarting it", rpcs, current);
        rpcs.restart().await?;
    }

    init().await?;
    rpcs.engine().conf().set(&key, &text).await?;
    Ok(true)
}
