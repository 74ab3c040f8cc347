//! # Engine
//!
//! The `Engine` is what test code holds on to: the transport to the agents,
//! the configurator client, engine-wide defaults and the log-buffer pool.
//! It hands out `RpcServer` handles.
//!
//! ## Server registration
//!
//! Every RPC server is an instance `/agent:<ta>/rpcserver:<name>` in the
//! configurator. Adding the instance starts the server on the agent and
//! deleting it stops the server. The instance value records how the server
//! came to be:
//!
//! | Value                          | Server                                  |
//! |--------------------------------|-----------------------------------------|
//! | (empty)                        | started from scratch                    |
//! | `fork_<parent>`                | forked from `parent`                    |
//! | `forkexec_<parent>`            | forked from `parent`, then exec'ed      |
//! | `fork[exec]_register_<parent>` | created by `parent`, registered after   |
//! | `thread_<parent>`              | a thread of `parent`                    |
//!
//! The session id lives at `/agent:<ta>/rpcserver:<name>/sid:`.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rpcwire::CallHeader;
use rpcwire::Errno;
use rpcwire::Module;
use rpcwire::TeErrno;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::builtin;
use crate::builtin::RetvalOut;
use crate::call::decode_out;
use crate::conf;
use crate::conf::Configurator;
use crate::config::EngineConfig;
use crate::logbuf::LogBufPool;
use crate::server::RpcServer;
use crate::transport::ServerId;
use crate::transport::Transport;

const NAME_MAX: usize = 64;
const RESERVED_PREFIXES: [&str; 3] = ["fork_", "forkexec_", "register_"];
const LONGEST_PREFIX: &str = "forkexec_register_";

/// Creation flags of `Engine::get`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CreateFlags(u32);

impl CreateFlags {
    /// Fail with `ENOENT` unless the server is already registered.
    pub const EXISTING: Self = Self(1 << 0);
    /// Keep a registered server if it answers, restart it otherwise.
    pub const REUSE: Self = Self(1 << 1);
    /// Create a thread of the parent instead of a forked process.
    pub const THREAD: Self = Self(1 << 2);
    /// Exec the server image after forking.
    pub const EXEC: Self = Self(1 << 3);
    /// Register a process the parent already created on the agent.
    pub const REGISTER: Self = Self(1 << 4);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0x1f)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for CreateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for CreateFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Callback run once after every successful creation.
pub type PostCreationHook = Arc<dyn Fn(&RpcServer) + Send + Sync>;

/// What a handle needs to talk to a freshly established session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Session {
    pub(crate) sid: u32,
    pub(crate) def_timeout: Duration,
}

struct EngineInner {
    transport: Arc<dyn Transport>,
    conf: Arc<dyn Configurator>,
    config: EngineConfig,
    hooks: Mutex<Vec<PostCreationHook>>,
    logbufs: LogBufPool,
    next_sid: AtomicU32,
}

/// Entry point of the RPC runtime.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(transport: Arc<dyn Transport>, conf: Arc<dyn Configurator>, config: EngineConfig) -> Self {
        let logbufs = LogBufPool::new(config.logbuf_capacity);
        let inner = EngineInner {
            transport,
            conf,
            config,
            hooks: Mutex::new(Vec::new()),
            logbufs,
            next_sid: AtomicU32::new(1),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn conf(&self) -> &dyn Configurator {
        self.inner.conf.as_ref()
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    pub fn logbufs(&self) -> &LogBufPool {
        &self.inner.logbufs
    }

    /// Adds a hook run after each successful `get`. Hooks run newest first.
    pub fn register_post_creation_hook(&self, hook: impl Fn(&RpcServer) + Send + Sync + 'static) {
        self.inner.hooks.lock().unwrap_or_else(PoisonError::into_inner).push(Arc::new(hook));
    }

    /// Starts a fresh server, restarting one already registered under
    /// `name`.
    pub async fn create(&self, agent: &str, name: &str) -> Result<RpcServer, TeErrno> {
        self.get(agent, name, None, CreateFlags::empty()).await
    }

    /// Gets a handle for server `name` on `agent`, creating, reusing or
    /// restarting the server as `flags` say. `father` names the parent of
    /// forked, exec'ed, threaded and registered servers.
    pub async fn get(
        &self,
        agent: &str,
        name: &str,
        father: Option<&str>,
        flags: CreateFlags,
    ) -> Result<RpcServer, TeErrno> {
        validate(name, father, flags)?;

        let session = self.establish(agent, name, father, flags).await.inspect_err(|e| {
            error!("Failed to get RPC server {} on {}: {}", name, agent, e);
        })?;

        let rpcs = RpcServer::new(self.clone(), agent, name, session);
        debug!("RPC server {} ready, sid {}", rpcs, session.sid);

        let hooks = self.inner.hooks.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for hook in hooks.iter().rev() {
            hook(&rpcs);
        }
        Ok(rpcs)
    }

    /// Restarts every registered server on every agent.
    pub async fn restart_all(&self) -> Result<(), TeErrno> {
        let keys = self.conf().find("/agent:*/rpcserver:*").await?;
        let mut result = Ok(());

        for key in &keys {
            let Some((agent, name)) = conf::parse_server_key(key) else {
                continue;
            };
            if let Err(e) = self.get(agent, name, None, CreateFlags::EXISTING).await {
                error!("Failed to restart RPC server {} on {}: {}", name, agent, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Brings the configurator entry of a server to the state `flags` ask
    /// for, and returns the session to talk to.
    pub(crate) async fn establish(
        &self,
        agent: &str,
        name: &str,
        father: Option<&str>,
        flags: CreateFlags,
    ) -> Result<Session, TeErrno> {
        let conf = self.conf();
        let key = conf::server_key(agent, name);
        let sid_key = conf::server_leaf(agent, name, "sid");
        let def_timeout = self.agent_timeout(agent).await;

        let existing = conf.get(&key).await?;
        if existing.is_none() && flags.contains(CreateFlags::EXISTING) {
            return Err(TeErrno::new(Module::RcfApi, Errno::NoEntry));
        }

        let mut sid = match existing {
            Some(_) => conf.get(&sid_key).await?.and_then(|v| v.parse().ok()).unwrap_or(0),
            None => 0,
        };
        if sid == 0 {
            sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(father) = father {
            if conf.get(&conf::server_key(agent, father)).await?.is_none() {
                error!("Parent RPC server {} does not exist on {}", father, agent);
                return Err(TeErrno::new(Module::RcfApi, Errno::NoEntry));
            }
        }

        match existing {
            Some(old) => {
                let mut reuse = flags.contains(CreateFlags::REUSE);
                if reuse && !self.probe(agent, name, sid, def_timeout).await {
                    warn!("RPC server {} on {} does not answer, restarting it", name, agent);
                    reuse = false;
                }
                if !reuse {
                    conf.del(&key).await?;
                    conf.add(&key, &old).await?;
                }
            }
            None => conf.add(&key, &lineage(father, flags)).await?,
        }
        conf.set(&sid_key, &sid.to_string()).await?;

        Ok(Session { sid, def_timeout })
    }

    /// Per-agent default call timeout, in seconds in the configurator.
    async fn agent_timeout(&self, agent: &str) -> Duration {
        let key = format!("/agent:{}/rpc_default_timeout:", agent);
        let secs = match self.conf().get(&key).await {
            Ok(Some(v)) => v.trim().parse::<i64>().unwrap_or(0),
            _ => 0,
        };
        if secs <= 0 {
            return self.inner.config.default_timeout;
        }
        Duration::from_secs(secs.unsigned_abs())
    }

    /// Whether a registered server still answers `getpid`.
    async fn probe(&self, agent: &str, name: &str, sid: u32, deadline: Duration) -> bool {
        let id = ServerId { agent: agent.to_owned(), server: name.to_owned(), sid };
        let header = CallHeader { func: builtin::GETPID, sid, seq: 1, ..Default::default() };
        let Ok(reply) = self.roundtrip(&id, &header, &[], deadline).await else {
            return false;
        };
        match decode_out::<RetvalOut>(&reply.out) {
            Ok(out) => reply.errno.is_ok() && out.retval >= 0,
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("config", &self.inner.config).finish_non_exhaustive()
    }
}

/// Rejects bad names and contradictory flags.
pub(crate) fn validate(name: &str, father: Option<&str>, flags: CreateFlags) -> Result<(), TeErrno> {
    let invalid = |why: &str| {
        error!("Cannot get RPC server '{}': {}", name, why);
        Err(TeErrno::new(Module::RcfApi, Errno::InvalidArgument))
    };

    if name.is_empty() || name.len() >= NAME_MAX - LONGEST_PREFIX.len() {
        return invalid("bad name length");
    }
    if let Some(prefix) = RESERVED_PREFIXES.iter().find(|p| name.starts_with(*p)) {
        return invalid(&format!("names must not start with '{}'", prefix));
    }
    if father.is_some() && flags.intersects(CreateFlags::EXISTING | CreateFlags::REUSE) {
        return invalid("a child cannot be reused or required to exist");
    }
    if father.is_none() && flags.intersects(CreateFlags::THREAD | CreateFlags::REGISTER) {
        return invalid("threads and registered processes need a parent");
    }
    if flags.contains(CreateFlags::THREAD | CreateFlags::REGISTER) {
        return invalid("a thread cannot be registered");
    }
    Ok(())
}

/// The configurator value describing how a server was made.
pub(crate) fn lineage(father: Option<&str>, flags: CreateFlags) -> String {
    let Some(father) = father else {
        return String::new();
    };
    if flags.contains(CreateFlags::THREAD) {
        return format!("thread_{}", father);
    }
    let mut value = String::from(if flags.contains(CreateFlags::EXEC) { "forkexec_" } else { "fork_" });
    if flags.contains(CreateFlags::REGISTER) {
        value.push_str("register_");
    }
    value.push_str(father);
    value
}
