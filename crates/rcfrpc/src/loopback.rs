//! # Loopback Agent
//!
//! An in-process stand-in for a test agent. It is both the `Transport` and
//! the `Configurator` of an `Engine`: adding `/agent:<ta>/rpcserver:<name>`
//! starts a server, deleting it stops the server, and calls are dispatched
//! to async functions registered with `register`.
//!
//! Every server understands the built-in procedures and holds at most one
//! deferred job, which runs as a tokio task until the matching `Complete`
//! call collects it. Functions nobody registered fail with `ERPCNOTSUPP`.
//!
//! Servers are keyed by agent and server name; the session id is not
//! checked.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use rpcpack::Pack;
use rpcpack::Unpack;
use rpcwire::CallHeader;
use rpcwire::CallMode;
use rpcwire::Errno;
use rpcwire::Module;
use rpcwire::ReplyEncoder;
use rpcwire::ReplyHeader;
use rpcwire::RpcFrame;
use rpcwire::TeErrno;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::builtin;
use crate::builtin::CreateProcessIn;
use crate::builtin::CreateProcessOut;
use crate::builtin::IsOpDoneOut;
use crate::builtin::NamespaceIn;
use crate::builtin::NamespaceOut;
use crate::builtin::RetvalOut;
use crate::builtin::SetlibnameIn;
use crate::conf;
use crate::conf::Configurator;
use crate::conf::MemoryConfigurator;
use crate::transport;
use crate::transport::ServerId;
use crate::transport::Transport;

const FIRST_PID: u32 = 1000;

fn rpcs_errno(errno: Errno) -> TeErrno {
    TeErrno::new(Module::Rpcs, errno)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a registered function reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome<O> {
    pub out: O,
    pub errno: TeErrno,
    pub errno_changed: bool,
    pub err_msg: String,
}

impl<O> Outcome<O> {
    /// Success with an untouched errno.
    pub fn ok(out: O) -> Self {
        Self { out, errno: TeErrno::OK, errno_changed: false, err_msg: String::new() }
    }

    /// The function failed and set errno.
    pub fn err(out: O, errno: Errno) -> Self {
        Self { out, errno: TeErrno::new(Module::Rpc, errno), errno_changed: true, err_msg: String::new() }
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.err_msg = msg.into();
        self
    }

    pub fn with_errno_changed(mut self, changed: bool) -> Self {
        self.errno_changed = changed;
        self
    }
}

/// How a server went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Asked to exit.
    Exited,
    /// Killed, because it was marked dead.
    Killed,
    /// Already reaped; nothing was left to stop.
    Reaped,
}

/// A finished invocation, output still encoded.
#[derive(Debug, Default)]
struct Done {
    out: Vec<u8>,
    errno: TeErrno,
    err_msg: String,
    errno_changed: bool,
    duration_us: u64,
}

impl Done {
    fn out<O: Pack + ?Sized>(out: &O) -> Self {
        match rpcpack::to_bytes(out) {
            Ok(out) => Self { out, ..Default::default() },
            Err(_) => Self::fail(rpcs_errno(Errno::Proto)),
        }
    }

    fn fail(errno: TeErrno) -> Self {
        Self { errno, ..Default::default() }
    }

    fn with_errno(mut self, errno: TeErrno) -> Self {
        self.errno = errno;
        self
    }

    fn with_msg(mut self, msg: String) -> Self {
        self.err_msg = msg;
        self
    }

    fn from_outcome<O: Pack>(outcome: Outcome<O>) -> Self {
        let mut done = Self::out(&outcome.out);
        if done.errno.is_ok() {
            done.errno = outcome.errno;
            done.errno_changed = outcome.errno_changed;
            done.err_msg = outcome.err_msg;
        }
        done
    }
}

type Handler = Arc<dyn Fn(&[u8]) -> Result<BoxFuture<'static, Done>, TeErrno> + Send + Sync>;

struct Job {
    id: u64,
    func: String,
    handle: JoinHandle<Done>,
}

struct Process {
    pid: u32,
    libname: Mutex<Option<String>>,
    job: Mutex<Option<Job>>,
}

impl Process {
    fn new(pid: u32) -> Self {
        Self { pid, libname: Mutex::new(None), job: Mutex::new(None) }
    }

    fn abort_job(&self) {
        if let Some(job) = lock(&self.job).take() {
            debug!("loopback: dropping deferred {}() job {:#x}", job.func, job.id);
            job.handle.abort();
        }
    }
}

type Key = (String, String);

fn key(agent: &str, server: &str) -> Key {
    (agent.to_owned(), server.to_owned())
}

fn decode_args<I: Unpack + Default>(args: &[u8]) -> Result<I, TeErrno> {
    if args.is_empty() {
        return Ok(I::default());
    }
    rpcpack::from_bytes(args).map_err(|_| rpcs_errno(Errno::Proto))
}

fn elapsed_us(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}

/// In-process agent hosting any number of RPC servers.
pub struct Loopback {
    tree: MemoryConfigurator,
    handlers: DashMap<String, Handler>,
    processes: DashMap<Key, Arc<Process>>,
    registered: DashMap<Key, u32>,
    stops: DashMap<Key, Stop>,
    namespaces: Mutex<Vec<String>>,
    next_pid: AtomicU32,
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl Loopback {
    pub fn new() -> Self {
        Self {
            tree: MemoryConfigurator::new(),
            handlers: DashMap::new(),
            processes: DashMap::new(),
            registered: DashMap::new(),
            stops: DashMap::new(),
            namespaces: Mutex::new(vec![String::new()]),
            next_pid: AtomicU32::new(FIRST_PID),
        }
    }

    /// Makes `name` callable on every server of this agent.
    pub fn register<I, O, F, Fut>(&self, name: &str, f: F)
    where
        I: Unpack + Default + Send + 'static,
        O: Pack + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<O>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args: &[u8]| {
            let input = decode_args::<I>(args)?;
            let fut = f(input);
            Ok(async move { Done::from_outcome(fut.await) }.boxed())
        });
        self.handlers.insert(name.to_owned(), handler);
    }

    /// Id of the pointer namespace `name`, allocating one if needed.
    pub fn register_namespace(&self, name: &str) -> u16 {
        let mut names = lock(&self.namespaces);
        let idx = match names.iter().position(|n| n == name) {
            Some(idx) => idx,
            None => {
                names.push(name.to_owned());
                names.len() - 1
            }
        };
        u16::try_from(idx).unwrap_or(u16::MAX)
    }

    /// The configuration tree behind the agent.
    pub fn tree(&self) -> &MemoryConfigurator {
        &self.tree
    }

    pub fn pid(&self, agent: &str, server: &str) -> Option<u32> {
        self.processes.get(&key(agent, server)).map(|p| p.pid)
    }

    pub fn is_running(&self, agent: &str, server: &str) -> bool {
        self.processes.contains_key(&key(agent, server))
    }

    /// The library selected with `setlibname`.
    pub fn libname(&self, agent: &str, server: &str) -> Option<String> {
        let process = self.processes.get(&key(agent, server)).map(|p| p.value().clone())?;
        let libname = lock(&process.libname).clone();
        libname
    }

    /// How the server last went away.
    pub fn last_stop(&self, agent: &str, server: &str) -> Option<Stop> {
        self.stops.get(&key(agent, server)).map(|s| *s)
    }

    /// Makes a server vanish behind the engine's back, as a crash would.
    pub fn kill(&self, agent: &str, server: &str) -> bool {
        match self.processes.remove(&key(agent, server)) {
            Some((_, process)) => {
                process.abort_job();
                true
            }
            None => false,
        }
    }

    fn fresh_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    fn start(&self, agent: &str, server: &str, lineage: &str) {
        let pid = if let Some(parent) = lineage.strip_prefix("thread_") {
            self.pid(agent, parent).unwrap_or_else(|| self.fresh_pid())
        } else if lineage.contains("register_") {
            self.registered
                .remove(&key(agent, server))
                .map(|(_, pid)| pid)
                .unwrap_or_else(|| self.fresh_pid())
        } else {
            self.fresh_pid()
        };

        self.stops.remove(&key(agent, server));
        self.processes.insert(key(agent, server), Arc::new(Process::new(pid)));
        debug!("loopback: started RPC server {} on {} as pid {}", server, agent, pid);
    }

    fn stop(&self, agent: &str, server: &str, how: Stop) {
        if let Some((_, process)) = self.processes.remove(&key(agent, server)) {
            process.abort_job();
        }
        self.stops.insert(key(agent, server), how);
        debug!("loopback: RPC server {} on {} stopped: {:?}", server, agent, how);
    }

    fn handler(&self, func: &str) -> Option<Handler> {
        self.handlers.get(func).map(|h| h.value().clone())
    }

    async fn dispatch(&self, id: &ServerId, process: &Process, header: &CallHeader<'_>, args: &[u8]) -> (Done, u64) {
        match header.func {
            builtin::IS_OP_DONE => (self.is_op_done(process, header.jobid), 0),
            builtin::IS_ALIVE => (Done::default(), 0),
            builtin::GETPID => {
                let retval = i32::try_from(process.pid).unwrap_or(i32::MAX);
                (Done::out(&RetvalOut { retval }), 0)
            }
            builtin::NAMESPACE_ID2STR => (self.namespace_id2str(args), 0),
            builtin::SETLIBNAME => (self.setlibname(process, args), 0),
            builtin::EXECVE => {
                process.abort_job();
                (Done::default(), 0)
            }
            builtin::CREATE_PROCESS => (self.create_process(id, args), 0),
            func => match header.mode {
                CallMode::Immediate => (self.run(func, args).await, 0),
                CallMode::Deferred => self.defer(process, func, args),
                CallMode::Complete => (self.complete(process, header.jobid).await, header.jobid),
            },
        }
    }

    async fn run(&self, func: &str, args: &[u8]) -> Done {
        let Some(handler) = self.handler(func) else {
            return Done::fail(TeErrno::new(Module::Rpc, Errno::Unsupported));
        };
        let fut = match handler(args) {
            Ok(fut) => fut,
            Err(errno) => return Done::fail(errno),
        };

        let start = Instant::now();
        let mut done = fut.await;
        done.duration_us = elapsed_us(start);
        done
    }

    fn defer(&self, process: &Process, func: &str, args: &[u8]) -> (Done, u64) {
        let Some(handler) = self.handler(func) else {
            return (Done::fail(TeErrno::new(Module::Rpc, Errno::Unsupported)), 0);
        };

        let mut slot = lock(&process.job);
        if slot.is_some() {
            return (Done::fail(rpcs_errno(Errno::Busy)), 0);
        }
        let fut = match handler(args) {
            Ok(fut) => fut,
            Err(errno) => return (Done::fail(errno), 0),
        };

        let id = loop {
            let id: u64 = rand::random();
            if id != 0 {
                break id;
            }
        };
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            let mut done = fut.await;
            done.duration_us = elapsed_us(start);
            done
        });
        *slot = Some(Job { id, func: func.to_owned(), handle });
        (Done::default(), id)
    }

    async fn complete(&self, process: &Process, jobid: u64) -> Done {
        let job = {
            let mut slot = lock(&process.job);
            match slot.as_ref() {
                Some(job) if job.id == jobid => slot.take(),
                _ => None,
            }
        };
        let Some(job) = job else {
            return Done::fail(rpcs_errno(Errno::Already));
        };

        match job.handle.await {
            Ok(done) => done,
            Err(e) => Done::fail(rpcs_errno(Errno::Fail)).with_msg(e.to_string()),
        }
    }

    fn is_op_done(&self, process: &Process, jobid: u64) -> Done {
        let slot = lock(&process.job);
        match slot.as_ref() {
            Some(job) if job.id == jobid => Done::out(&IsOpDoneOut { done: job.handle.is_finished() }),
            _ => Done::fail(rpcs_errno(Errno::NoEntry)),
        }
    }

    fn namespace_id2str(&self, args: &[u8]) -> Done {
        let input = match decode_args::<NamespaceIn>(args) {
            Ok(input) => input,
            Err(errno) => return Done::fail(errno),
        };
        let names = lock(&self.namespaces);
        match names.get(usize::from(input.id)) {
            Some(name) => Done::out(&NamespaceOut { retval: 0, name: name.clone() }),
            None => Done::out(&NamespaceOut { retval: -1, name: String::new() })
                .with_errno(TeErrno::new(Module::Rpc, Errno::NoEntry)),
        }
    }

    fn setlibname(&self, process: &Process, args: &[u8]) -> Done {
        let input = match decode_args::<SetlibnameIn>(args) {
            Ok(input) => input,
            Err(errno) => return Done::fail(errno),
        };
        *lock(&process.libname) = input.libname;
        Done::out(&RetvalOut { retval: 0 })
    }

    fn create_process(&self, id: &ServerId, args: &[u8]) -> Done {
        let input = match decode_args::<CreateProcessIn>(args) {
            Ok(input) => input,
            Err(errno) => return Done::fail(errno),
        };
        let pid = self.fresh_pid();
        self.registered.insert(key(&id.agent, &input.name), pid);
        Done::out(&CreateProcessOut { pid: i32::try_from(pid).unwrap_or(i32::MAX) })
    }
}

#[async_trait]
impl Transport for Loopback {
    async fn exchange(&self, server: &ServerId, request: &[u8], _deadline: Duration) -> transport::Result<Vec<u8>> {
        let call = match RpcFrame::decode(request) {
            Ok(RpcFrame::Call(call)) => call,
            Ok(RpcFrame::Reply(_)) => return Err(transport::Error::Io("reply frame sent to a server".into())),
            Err(e) => return Err(transport::Error::Io(format!("undecodable request: {}", e))),
        };

        let process = self
            .processes
            .get(&key(&server.agent, &server.server))
            .map(|p| p.value().clone())
            .ok_or_else(|| transport::Error::ConnectionLost(format!("no RPC server {}", server)))?;

        let (done, jobid) = self.dispatch(server, &process, &call.header, call.args).await;

        let header = ReplyHeader {
            seq: call.header.seq,
            errno: done.errno,
            err_msg: &done.err_msg,
            duration_us: done.duration_us,
            jobid,
            errno_changed: done.errno_changed,
        };
        ReplyEncoder::new(&header, &done.out)
            .to_bytes()
            .map_err(|e| transport::Error::Io(format!("cannot encode reply: {}", e)))
    }
}

#[async_trait]
impl Configurator for Loopback {
    async fn get(&self, key: &str) -> conf::Result<Option<String>> {
        self.tree.get(key).await
    }

    async fn add(&self, key: &str, value: &str) -> conf::Result<()> {
        self.tree.add(key, value).await?;
        if let Some((agent, server)) = conf::parse_server_key(key) {
            self.start(agent, server, value);
        }
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> conf::Result<()> {
        self.tree.set(key, value).await
    }

    async fn del(&self, key: &str) -> conf::Result<()> {
        let Some((agent, server)) = conf::parse_server_key(key) else {
            return self.tree.del(key).await;
        };

        let flag = |leaf: &str| self.tree.value(&conf::server_leaf(agent, server, leaf)).as_deref() == Some("1");
        let how = if flag("finished") {
            Stop::Reaped
        } else if flag("dead") {
            Stop::Killed
        } else {
            Stop::Exited
        };

        self.tree.del(key).await?;
        self.stop(agent, server, how);
        Ok(())
    }

    async fn find(&self, pattern: &str) -> conf::Result<Vec<String>> {
        self.tree.find(pattern).await
    }
}
