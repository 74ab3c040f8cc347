//! # RPC Server Handle
//!
//! An `RpcServer` owns the engine side of one live session with one remote
//! RPC server: who it is, how calls on it are timed and checked, and what
//! the last call observed.
//!
//! ## Invariants
//! - **Knobs**: per-call settings are taken by the call that uses them;
//!   right after any call they equal the handle's defaults again.
//! - **Seq**: advances by one (mod 2^16) for every call that completed end
//!   to end, and for nothing else.
//! - **Poison**: once a call times out or loses the server, every further
//!   call fails with `ETIMEDOUT` until `restart`.
//! - **Single writer**: `call` is not re-entrant on one handle. A second
//!   concurrent `call` is refused with `EBUSY`. Readers that only observe
//!   may use a `Monitor` from any thread.
//!
//! The state lives behind a `std::sync::Mutex` that is never held across
//! an `.await`.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use rpcwire::CallMode;
use rpcwire::LibFlags;
use rpcwire::TeErrno;

use crate::deferred::Pending;
use crate::engine::Engine;
use crate::engine::Session;
use crate::policy::JumpPolicy;
use crate::transport::ServerId;

/// Settings that apply to the next call only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Knobs {
    /// Overrides the handle's default timeout.
    pub timeout: Option<Duration>,
    /// Route this call through libc instead of the library under test.
    pub use_libc_once: bool,
    /// Suppress the trace line unless the call fails.
    pub silent: bool,
    /// Treat an errno change on a successful call as corruption.
    pub errno_check: bool,
    pub policy: JumpPolicy,
    /// Scheduled start, ms since the epoch. Zero means now.
    pub start_ms: u64,
}

impl Knobs {
    pub fn defaults(silent: bool) -> Self {
        Self {
            timeout: None,
            use_libc_once: false,
            silent,
            errno_check: true,
            policy: JumpPolicy::AwaitNone,
            start_ms: 0,
        }
    }
}

impl Default for Knobs {
    fn default() -> Self {
        Self::defaults(false)
    }
}

#[derive(Debug)]
pub(crate) struct State {
    pub(crate) sid: u32,
    pub(crate) def_timeout: Duration,
    pub(crate) use_libc: bool,
    pub(crate) use_syscall: bool,
    pub(crate) silent_default: bool,
    pub(crate) next: Knobs,
    pub(crate) op: CallMode,

    pub(crate) last_op: CallMode,
    pub(crate) last_use_libc: bool,
    pub(crate) last_func: String,
    pub(crate) duration_us: u64,
    pub(crate) errno: TeErrno,
    pub(crate) err_msg: String,
    pub(crate) errno_changed: bool,
    pub(crate) seq: u16,

    pub(crate) deferred: Option<Pending>,
    pub(crate) namespaces: Vec<Option<String>>,

    pub(crate) timed_out: bool,
    pub(crate) dead: bool,
    pub(crate) finished: bool,
    pub(crate) libname: Option<String>,
}

impl State {
    fn new(session: &Session) -> Self {
        Self {
            sid: session.sid,
            def_timeout: session.def_timeout,
            use_libc: false,
            use_syscall: false,
            silent_default: false,
            next: Knobs::default(),
            op: CallMode::Immediate,
            last_op: CallMode::Immediate,
            last_use_libc: false,
            last_func: String::new(),
            duration_us: 0,
            errno: TeErrno::OK,
            err_msg: String::new(),
            errno_changed: false,
            seq: 0,
            deferred: None,
            namespaces: Vec::new(),
            timed_out: false,
            dead: false,
            finished: false,
            libname: None,
        }
    }

    /// Takes the next-call knobs, leaving the defaults behind.
    pub(crate) fn take_knobs(&mut self) -> Knobs {
        std::mem::replace(&mut self.next, Knobs::defaults(self.silent_default))
    }

    pub(crate) fn lib_flags(&self, use_libc_once: bool) -> LibFlags {
        LibFlags { use_libc: self.use_libc || use_libc_once, use_syscall: self.use_syscall }
    }

    /// Records the outcome of a call that never reached the server.
    pub(crate) fn settle_local(&mut self, errno: TeErrno) {
        self.errno = errno;
        self.err_msg.clear();
        self.errno_changed = false;
        self.duration_us = 0;
    }
}

pub(crate) struct Inner {
    pub(crate) agent: String,
    pub(crate) name: String,
    pub(crate) state: Mutex<State>,
    pub(crate) in_call: AtomicBool,
}

impl Inner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Engine-side handle of one RPC server session.
///
/// Created by `Engine::get` and its variants; released by `destroy`.
pub struct RpcServer {
    pub(crate) engine: Engine,
    pub(crate) inner: Arc<Inner>,
}

impl RpcServer {
    pub(crate) fn new(engine: Engine, agent: &str, name: &str, session: Session) -> Self {
        let inner = Inner {
            agent: agent.to_owned(),
            name: name.to_owned(),
            state: Mutex::new(State::new(&session)),
            in_call: AtomicBool::new(false),
        };
        Self { engine, inner: Arc::new(inner) }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock()
    }

    pub(crate) fn server_id(&self, sid: u32) -> ServerId {
        ServerId { agent: self.inner.agent.clone(), server: self.inner.name.clone(), sid }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn agent(&self) -> &str {
        &self.inner.agent
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// A read-only observer that may outlive borrows of this handle.
    pub fn monitor(&self) -> Monitor {
        Monitor { inner: self.inner.clone() }
    }

    // ------------------------------------------------------------------
    //  defaults
    // ------------------------------------------------------------------

    pub fn default_timeout(&self) -> Duration {
        self.lock().def_timeout
    }

    pub fn set_default_timeout(&self, timeout: Duration) {
        self.lock().def_timeout = timeout;
    }

    /// Default library selection for every call.
    pub fn set_use_libc(&self, use_libc: bool) {
        self.lock().use_libc = use_libc;
    }

    /// Advisory bit passed to every call; each remote function decides
    /// what it means.
    pub fn set_use_syscall(&self, use_syscall: bool) {
        self.lock().use_syscall = use_syscall;
    }

    /// Makes every call silent unless told otherwise.
    pub fn set_silent_default(&self, silent: bool) {
        let mut st = self.lock();
        st.silent_default = silent;
        st.next.silent = silent;
    }

    // ------------------------------------------------------------------
    //  next-call settings
    // ------------------------------------------------------------------

    /// Mode of the next call. Reverts to `Immediate` after it.
    pub fn set_op(&self, op: CallMode) {
        self.lock().op = op;
    }

    pub fn op(&self) -> CallMode {
        self.lock().op
    }

    /// Timeout of the next call.
    pub fn set_timeout(&self, timeout: Duration) {
        self.lock().next.timeout = Some(timeout);
    }

    /// Timeout of the next call for a remote operation that itself waits
    /// for `op_timeout`. Never shorter than the default.
    pub fn set_timeout_with_margin(&self, op_timeout: Duration) {
        let margin = self.engine.config().timeout_margin;
        let mut st = self.lock();
        let wanted = op_timeout.saturating_add(margin);
        st.next.timeout = Some(wanted.max(st.def_timeout));
    }

    /// Scheduled start of the next call, ms since the epoch.
    pub fn set_start(&self, start_ms: u64) {
        self.lock().next.start_ms = start_ms;
    }

    /// Sets the policy of the next call without a guard.
    pub fn set_policy(&self, policy: JumpPolicy) {
        self.lock().next.policy = policy;
    }

    /// Current next-call knobs.
    pub fn knobs(&self) -> Knobs {
        self.lock().next
    }

    /// What the knobs revert to after each call.
    pub fn default_knobs(&self) -> Knobs {
        Knobs::defaults(self.lock().silent_default)
    }

    // ------------------------------------------------------------------
    //  scoped modifiers
    // ------------------------------------------------------------------

    /// IUT errors of the next call are returned instead of jumping.
    pub fn await_iut_error(&self) -> KnobGuard<'_> {
        self.modify(|k| k.policy = JumpPolicy::AwaitIutOnly, |k, old| k.policy = old.policy)
    }

    /// No failure of the next call jumps.
    pub fn await_any_error(&self) -> KnobGuard<'_> {
        self.modify(|k| k.policy = JumpPolicy::AwaitAny, |k, old| k.policy = old.policy)
    }

    /// The next call is not traced unless it fails.
    pub fn silent(&self) -> KnobGuard<'_> {
        self.modify(|k| k.silent = true, |k, old| k.silent = old.silent)
    }

    /// The next call goes through libc.
    pub fn use_libc_once(&self) -> KnobGuard<'_> {
        self.modify(|k| k.use_libc_once = true, |k, old| k.use_libc_once = old.use_libc_once)
    }

    /// An errno change on success is not flagged for the next call.
    pub fn no_errno_check(&self) -> KnobGuard<'_> {
        self.modify(|k| k.errno_check = false, |k, old| k.errno_check = old.errno_check)
    }

    fn modify(&self, set: fn(&mut Knobs), restore: fn(&mut Knobs, &Knobs)) -> KnobGuard<'_> {
        let mut st = self.lock();
        let saved = st.next;
        set(&mut st.next);
        KnobGuard { rpcs: self, saved, restore }
    }

    // ------------------------------------------------------------------
    //  last-call observables
    // ------------------------------------------------------------------

    pub fn sid(&self) -> u32 {
        self.lock().sid
    }

    pub fn seq(&self) -> u16 {
        self.lock().seq
    }

    pub fn errno(&self) -> TeErrno {
        self.lock().errno
    }

    pub fn err_msg(&self) -> String {
        self.lock().err_msg.clone()
    }

    pub fn errno_changed(&self) -> bool {
        self.lock().errno_changed
    }

    pub fn duration_us(&self) -> u64 {
        self.lock().duration_us
    }

    pub fn last_op(&self) -> CallMode {
        self.lock().last_op
    }

    pub fn last_func(&self) -> String {
        self.lock().last_func.clone()
    }

    pub fn last_use_libc(&self) -> bool {
        self.lock().last_use_libc
    }

    pub fn timed_out(&self) -> bool {
        self.lock().timed_out
    }

    pub fn is_dead(&self) -> bool {
        self.lock().dead
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn libname(&self) -> Option<String> {
        self.lock().libname.clone()
    }
}

impl std::fmt::Display for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.inner.agent, self.inner.name)
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("agent", &self.inner.agent)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

/// Restores one knob when dropped.
#[must_use = "the modifier is undone as soon as the guard is dropped"]
pub struct KnobGuard<'a> {
    rpcs: &'a RpcServer,
    saved: Knobs,
    restore: fn(&mut Knobs, &Knobs),
}

impl Drop for KnobGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.rpcs.lock();
        (self.restore)(&mut st.next, &self.saved);
    }
}

/// Read-only view of a handle's trace fields.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<Inner>,
}

impl Monitor {
    pub fn agent(&self) -> &str {
        &self.inner.agent
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn seq(&self) -> u16 {
        self.inner.lock().seq
    }

    pub fn errno(&self) -> TeErrno {
        self.inner.lock().errno
    }

    pub fn duration_us(&self) -> u64 {
        self.inner.lock().duration_us
    }

    pub fn last_func(&self) -> String {
        self.inner.lock().last_func.clone()
    }

    pub fn timed_out(&self) -> bool {
        self.inner.lock().timed_out
    }
}
