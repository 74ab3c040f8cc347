//! # Call Runtime
//!
//! `RpcServer::call` turns one typed invocation into one timed, traced and
//! checked exchange with the server:
//!
//! 1. take the next-call knobs and the pending mode off the handle;
//! 2. refuse without contacting the server when the handle is poisoned or
//!    the mode conflicts with the deferred slot;
//! 3. encode the input record under the common call header and hand it to
//!    the transport with the resolved deadline;
//! 4. decode the reply, copy errno, message and duration onto the handle,
//!    and commit the sequence number;
//! 5. return a `Completed` that the wrapper validates, then `finish`es into
//!    the output record or a `Jump`.
//!
//! Exactly one trace line is written per call, when the `Completed` is
//! finished or dropped, so its level reflects the validators' verdict.
//!
//! ## Invariants
//! - **Refusals do not poison**: `EBUSY`, `EALREADY` and `EPERM` leave the
//!   handle usable; only a timeout or a lost server poisons it.
//! - **Echo**: a reply answering another sequence number is `ECORRUPTED`,
//!   even when the rest of it does not decode.

use std::fmt::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rpcpack::Pack;
use rpcpack::Unpack;
use rpcwire::CallEncoder;
use rpcwire::CallHeader;
use rpcwire::CallMode;
use rpcwire::Errno;
use rpcwire::LibFlags;
use rpcwire::Module;
use rpcwire::RpcFrame;
use rpcwire::TeErrno;
use rpcwire::frame::decode_seq;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::builtin;
use crate::deferred::Pending;
use crate::engine::Engine;
use crate::logbuf::LogBuf;
use crate::namespace;
use crate::policy;
use crate::policy::Jump;
use crate::policy::JumpPolicy;
use crate::policy::Source;
use crate::server::Knobs;
use crate::server::RpcServer;
use crate::transport;
use crate::transport::ServerId;

pub(crate) fn rcf_rpc(errno: Errno) -> TeErrno {
    TeErrno::new(Module::RcfRpc, errno)
}

/// Whether the RPC layer delivered the call. Errors reported by the
/// remote function itself still count as delivered.
pub fn is_call_ok(errno: TeErrno) -> bool {
    errno.is_ok() || errno.module() == Some(Module::Rpc)
}

/// Failures after which the remote state is unknown.
pub(crate) fn poisons(errno: TeErrno) -> bool {
    errno.module() == Some(Module::RcfRpc) && (errno.is(Errno::TimedOut) || errno.is(Errno::RpcDead))
}

pub(crate) fn transport_errno(e: &transport::Error) -> TeErrno {
    match e {
        transport::Error::Timeout => rcf_rpc(Errno::TimedOut),
        transport::Error::ConnectionLost(_) => rcf_rpc(Errno::RpcDead),
        transport::Error::PayloadTooLarge => rcf_rpc(Errno::MsgSize),
        transport::Error::Io(_) => rcf_rpc(Errno::Io),
    }
}

/// A reply with its output record still encoded.
#[derive(Debug)]
pub(crate) struct RawReply {
    pub(crate) errno: TeErrno,
    pub(crate) err_msg: String,
    pub(crate) duration_us: u64,
    pub(crate) jobid: u64,
    pub(crate) errno_changed: bool,
    pub(crate) out: Vec<u8>,
}

/// A built-in call's decoded output with its reply header.
#[derive(Debug)]
pub(crate) struct Raw<O> {
    pub(crate) out: O,
    pub(crate) errno: TeErrno,
    pub(crate) err_msg: String,
    pub(crate) duration_us: u64,
}

pub(crate) fn decode_out<O: Unpack + Default>(bytes: &[u8]) -> Result<O, TeErrno> {
    if bytes.is_empty() {
        return Ok(O::default());
    }
    rpcpack::from_bytes(bytes).map_err(|e| {
        warn!("cannot decode output record: {}", e);
        rcf_rpc(Errno::Proto)
    })
}

impl Engine {
    /// One request/response exchange. The deadline is passed to the
    /// transport and enforced here as well.
    pub(crate) async fn roundtrip(
        &self,
        id: &ServerId,
        header: &CallHeader<'_>,
        args: &[u8],
        deadline: Duration,
    ) -> Result<RawReply, TeErrno> {
        let request = CallEncoder::new(header, args).to_bytes().map_err(|e| {
            warn!("{}: cannot encode {}(): {}", id, header.func, e);
            rcf_rpc(Errno::InvalidArgument)
        })?;

        let exchange = self.transport().exchange(id, &request, deadline);
        let response = match tokio::time::timeout(deadline, exchange).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!("{}: {}() failed in transport: {}", id, header.func, e);
                return Err(transport_errno(&e));
            }
            Err(_) => {
                warn!("{}: {}() timed out after {:?}", id, header.func, deadline);
                return Err(rcf_rpc(Errno::TimedOut));
            }
        };

        let reply = match RpcFrame::decode(&response) {
            Ok(RpcFrame::Reply(reply)) => reply,
            Ok(RpcFrame::Call(_)) => {
                warn!("{}: got a call frame in reply to {}()", id, header.func);
                return Err(rcf_rpc(Errno::Proto));
            }
            Err(e) => {
                return Err(match decode_seq(&response) {
                    Ok(seq) if seq != header.seq => {
                        warn!("{}: undecodable reply with seq {} does not answer {}: {}", id, seq, header.seq, e);
                        rcf_rpc(Errno::Corrupted)
                    }
                    Ok(seq) => {
                        warn!("{}: cannot decode reply {} to {}(): {}", id, seq, header.func, e);
                        rcf_rpc(Errno::Proto)
                    }
                    Err(_) => {
                        warn!("{}: cannot decode reply to {}(): {}", id, header.func, e);
                        rcf_rpc(Errno::Proto)
                    }
                });
            }
        };

        if reply.header.seq != header.seq {
            warn!("{}: reply seq {} does not answer {}", id, reply.header.seq, header.seq);
            return Err(rcf_rpc(Errno::Corrupted));
        }

        Ok(RawReply {
            errno: reply.header.errno,
            err_msg: reply.header.err_msg.to_owned(),
            duration_us: reply.header.duration_us,
            jobid: reply.header.jobid,
            errno_changed: reply.header.errno_changed,
            out: reply.out.to_vec(),
        })
    }
}

/// Marks a handle as inside `call` for as long as it lives.
struct Entered<'a>(&'a AtomicBool);

impl<'a> Entered<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What `call` latched off the handle before talking to the server.
struct Latched {
    knobs: Knobs,
    op: CallMode,
    lib: LibFlags,
    id: ServerId,
    seq: u16,
    jobid: u64,
    deadline: Duration,
}

impl RpcServer {
    /// Executes `func` on the server with `input`.
    ///
    /// The result must be validated with the checks on `Completed` and
    /// then `finish`ed. In `Deferred` mode it only tells whether the server
    /// accepted the request; the output arrives with the `Complete` call.
    pub async fn call<'a, I, O>(&'a self, func: &'a str, input: &I) -> Completed<'a, O>
    where
        I: Pack + ?Sized,
        O: Unpack + Default,
    {
        let args = rpcpack::to_bytes(input);

        let Some(_entered) = Entered::enter(&self.inner.in_call) else {
            let errno = rcf_rpc(Errno::Busy);
            let (knobs, op) = {
                let mut st = self.lock();
                let knobs = st.take_knobs();
                let op = std::mem::take(&mut st.op);
                st.settle_local(errno);
                (knobs, op)
            };
            warn!("RPC {} {}() issued while another call is in progress", self, func);
            return self.refused(func, knobs, op, &args, errno);
        };

        let latched = match self.latch(func) {
            Ok(latched) => latched,
            Err((knobs, op, errno)) => return self.refused(func, knobs, op, &args, errno),
        };

        let args = match args {
            Ok(args) => args,
            Err(e) => {
                warn!("RPC {} cannot encode {}() arguments: {}", self, func, e);
                let errno = rcf_rpc(Errno::InvalidArgument);
                self.lock().settle_local(errno);
                return self.completed(func, &latched, errno, O::default(), &[], &[]);
            }
        };

        let header = CallHeader {
            func,
            mode: latched.op,
            sid: latched.id.sid,
            seq: latched.seq,
            start_ms: latched.knobs.start_ms,
            lib: latched.lib,
            silent: latched.knobs.silent,
            jobid: latched.jobid,
        };
        let sent: &[u8] = if latched.op == CallMode::Complete { &[] } else { &args };

        let reply = self.engine.roundtrip(&latched.id, &header, sent, latched.deadline).await;
        let decoded = reply.and_then(|reply| decode_out::<O>(&reply.out).map(|out| (reply, out)));

        let (reply, out) = match decoded {
            Ok(done) => done,
            Err(errno) => {
                let mut st = self.lock();
                st.settle_local(errno);
                if poisons(errno) {
                    st.timed_out = true;
                }
                drop(st);
                return self.completed(func, &latched, errno, O::default(), &args, &[]);
            }
        };

        {
            let mut st = self.lock();
            st.seq = latched.seq;
            st.errno = reply.errno;
            st.err_msg.clone_from(&reply.err_msg);
            st.errno_changed = reply.errno_changed;
            st.duration_us = reply.duration_us;
            match latched.op {
                CallMode::Deferred if reply.errno.is_ok() => {
                    st.deferred = Some(Pending { jobid: reply.jobid, func: func.to_owned() });
                }
                CallMode::Complete => st.deferred = None,
                _ => {}
            }
        }

        if !latched.knobs.silent {
            self.resolve_namespaces(&[args.as_slice(), reply.out.as_slice()]).await;
        }

        let mut done = self.completed(func, &latched, reply.errno, out, &args, &reply.out);
        done.err_msg = reply.err_msg;
        done.errno_changed = reply.errno_changed;
        done.duration_us = reply.duration_us;
        done
    }

    /// Takes knobs and mode, and checks the handle may be called.
    fn latch(&self, func: &str) -> Result<Latched, (Knobs, CallMode, TeErrno)> {
        let mut st = self.lock();
        let knobs = st.take_knobs();
        let op = std::mem::take(&mut st.op);
        let lib = st.lib_flags(knobs.use_libc_once);

        st.last_op = op;
        st.last_use_libc = lib.use_libc;
        func.clone_into(&mut st.last_func);

        let refusal = if st.timed_out {
            Some(Errno::TimedOut)
        } else {
            match (op, &st.deferred) {
                (CallMode::Complete, None) => Some(Errno::Already),
                (CallMode::Complete, Some(pending)) if pending.func != func => Some(Errno::PermissionDenied),
                (CallMode::Complete, Some(_)) => None,
                (_, Some(_)) => Some(Errno::Busy),
                (_, None) => None,
            }
        };

        if let Some(errno) = refusal {
            let errno = rcf_rpc(errno);
            st.settle_local(errno);
            return Err((knobs, op, errno));
        }

        Ok(Latched {
            knobs,
            op,
            lib,
            id: self.server_id(st.sid),
            seq: st.seq.wrapping_add(1),
            jobid: st.deferred.as_ref().map_or(0, |p| p.jobid),
            deadline: knobs.timeout.unwrap_or(st.def_timeout),
        })
    }

    fn refused<'a, O: Default>(
        &'a self,
        func: &'a str,
        knobs: Knobs,
        op: CallMode,
        args: &rpcpack::Result<Vec<u8>>,
        errno: TeErrno,
    ) -> Completed<'a, O> {
        let latched = Latched {
            knobs,
            op,
            lib: LibFlags::default(),
            id: self.server_id(0),
            seq: self.seq(),
            jobid: 0,
            deadline: Duration::ZERO,
        };
        let args = args.as_deref().unwrap_or(&[]);
        self.completed(func, &latched, errno, O::default(), args, &[])
    }

    fn completed<'a, O>(
        &'a self,
        func: &'a str,
        latched: &Latched,
        errno: TeErrno,
        out: O,
        args: &[u8],
        out_bytes: &[u8],
    ) -> Completed<'a, O> {
        let pool = self.engine.logbufs();
        let mut in_text = pool.take();
        let mut out_text = pool.take();
        {
            let cache = self.lock().namespaces.clone();
            namespace::render_record(args, &mut in_text, &cache);
            namespace::render_record(out_bytes, &mut out_text, &cache);
        }

        Completed {
            out,
            rpcs: self,
            func,
            mode: latched.op,
            policy: latched.knobs.policy,
            errno_check: latched.knobs.errno_check,
            silent: latched.knobs.silent,
            use_libc: latched.lib.use_libc,
            seq: self.seq(),
            duration_us: 0,
            errno,
            err_msg: String::new(),
            errno_changed: false,
            in_text,
            out_text,
            failed: false,
            err_log: false,
            logged: false,
        }
    }

    /// Calls a built-in procedure. Knobs, mode and the deferred slot are
    /// left alone; `bump` says whether the sequence number advances.
    pub(crate) async fn raw_call<I, O>(
        &self,
        func: &str,
        input: &I,
        timeout: Option<Duration>,
        jobid: u64,
        bump: bool,
    ) -> Result<Raw<O>, TeErrno>
    where
        I: Pack + ?Sized,
        O: Unpack + Default,
    {
        let raw = self.raw_exchange(func, input, timeout, jobid, bump).await;
        if let Err(errno) = &raw {
            if poisons(*errno) {
                self.lock().timed_out = true;
            }
        }
        raw
    }

    /// `raw_call` without poisoning the handle on a timeout or a lost
    /// server, for lookups whose failure only costs a trace its names.
    pub(crate) async fn raw_exchange<I, O>(
        &self,
        func: &str,
        input: &I,
        timeout: Option<Duration>,
        jobid: u64,
        bump: bool,
    ) -> Result<Raw<O>, TeErrno>
    where
        I: Pack + ?Sized,
        O: Unpack + Default,
    {
        let args = rpcpack::to_bytes(input).map_err(|e| {
            warn!("RPC {} cannot encode {}() arguments: {}", self, func, e);
            rcf_rpc(Errno::InvalidArgument)
        })?;

        let (id, seq, deadline, lib) = {
            let st = self.lock();
            if st.timed_out {
                return Err(rcf_rpc(Errno::TimedOut));
            }
            if st.deferred.is_some() && !builtin::exempt_from_pending(func) {
                return Err(rcf_rpc(Errno::Busy));
            }
            (self.server_id(st.sid), st.seq.wrapping_add(1), timeout.unwrap_or(st.def_timeout), st.lib_flags(false))
        };

        let header = CallHeader {
            func,
            mode: CallMode::Immediate,
            sid: id.sid,
            seq,
            start_ms: 0,
            lib,
            silent: false,
            jobid,
        };

        let reply = self.engine.roundtrip(&id, &header, &args, deadline).await?;
        let out = decode_out::<O>(&reply.out)?;

        if bump {
            self.lock().seq = seq;
        }
        Ok(Raw { out, errno: reply.errno, err_msg: reply.err_msg, duration_us: reply.duration_us })
    }

    /// Copies a built-in call's reply header onto the handle.
    pub(crate) fn settle_raw<O>(&self, raw: &Raw<O>) {
        let mut st = self.lock();
        st.errno = raw.errno;
        st.err_msg.clone_from(&raw.err_msg);
        st.errno_changed = false;
        st.duration_us = raw.duration_us;
    }
}

/// The outcome of one call, waiting for its validators.
///
/// Checks may downgrade the outcome to a failure; `finish` then writes the
/// trace line and decides whether to jump. Dropping it unfinished still
/// writes the line, but never jumps.
pub struct Completed<'a, O> {
    /// The decoded output record, or its default when the call failed.
    pub out: O,
    pub(crate) rpcs: &'a RpcServer,
    pub(crate) func: &'a str,
    pub(crate) mode: CallMode,
    pub(crate) policy: JumpPolicy,
    pub(crate) errno_check: bool,
    pub(crate) silent: bool,
    pub(crate) use_libc: bool,
    pub(crate) seq: u16,
    pub(crate) duration_us: u64,
    pub(crate) errno: TeErrno,
    pub(crate) err_msg: String,
    pub(crate) errno_changed: bool,
    pub(crate) in_text: LogBuf,
    pub(crate) out_text: LogBuf,
    pub(crate) failed: bool,
    pub(crate) err_log: bool,
    pub(crate) logged: bool,
}

impl<'a, O> Completed<'a, O> {
    pub fn rpcs(&self) -> &'a RpcServer {
        self.rpcs
    }

    pub fn errno(&self) -> TeErrno {
        self.errno
    }

    pub fn err_msg(&self) -> &str {
        &self.err_msg
    }

    pub fn errno_changed(&self) -> bool {
        self.errno_changed
    }

    pub fn mode(&self) -> CallMode {
        self.mode
    }

    pub fn duration_us(&self) -> u64 {
        self.duration_us
    }

    /// The RPC layer delivered the call, whatever the function returned.
    pub fn is_call_ok(&self) -> bool {
        is_call_ok(self.errno)
    }

    /// Whether a validator or the wrapper judged the call a failure.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Marks the call as an IUT failure when `cond` holds.
    pub fn fail_if(&mut self, cond: bool) -> bool {
        if cond && self.mode != CallMode::Deferred {
            self.fail_iut();
        }
        cond
    }

    pub(crate) fn fail_iut(&mut self) {
        self.failed = true;
        if self.policy.jumps_on(Source::Iut) {
            self.err_log = true;
        }
    }

    /// Stamps the call and its handle with `TAPI-ECORRUPTED`.
    pub(crate) fn corrupt(&mut self) {
        let errno = TeErrno::new(Module::Tapi, Errno::Corrupted);
        self.errno = errno;
        self.err_log = true;
        self.rpcs.lock().errno = errno;
    }

    /// The error word to jump with, if the policy says to jump.
    fn jump_errno(&self) -> Option<TeErrno> {
        if !self.is_call_ok() && self.policy.jumps_on(Source::NonIut) {
            return Some(self.errno);
        }
        if self.failed && self.policy.jumps_on(Source::Iut) {
            if self.errno.is_ok() {
                return Some(TeErrno::new(Module::Tapi, Errno::Fail));
            }
            return Some(self.errno);
        }
        None
    }

    fn log_line(&mut self) {
        if self.logged {
            return;
        }
        self.logged = true;

        let err_log = self.err_log || !self.is_call_ok();
        if self.silent && !err_log {
            return;
        }

        let rpcs = self.rpcs;
        let mut line = rpcs.engine.logbufs().take();
        let _ = write!(
            line,
            "RPC ({},{}){}{}: {}({}) -> ",
            rpcs.agent(),
            rpcs.name(),
            self.mode.trace_suffix(),
            if self.use_libc { " libc" } else { "" },
            self.func,
            self.in_text.as_str(),
        );
        if self.mode != CallMode::Deferred && !self.out_text.is_empty() {
            line.push_str(&self.out_text);
            line.push(' ');
        }
        let _ = write!(line, "({}", self.errno);
        if !self.err_msg.is_empty() {
            let _ = write!(line, ": {}", self.err_msg);
        }
        line.push(')');

        if err_log {
            error!(
                agent = rpcs.agent(),
                server = rpcs.name(),
                func = self.func,
                seq = self.seq,
                duration_us = self.duration_us,
                "{}",
                line.as_str()
            );
        } else {
            info!(
                agent = rpcs.agent(),
                server = rpcs.name(),
                func = self.func,
                seq = self.seq,
                duration_us = self.duration_us,
                "{}",
                line.as_str()
            );
        }
    }
}

impl<O: Default> Completed<'_, O> {
    /// Writes the trace line and hands out the output record, or jumps.
    pub fn finish(mut self) -> Result<O, Jump> {
        let jump = self.jump_errno();
        self.log_line();
        let out = std::mem::take(&mut self.out);

        match jump {
            None => Ok(out),
            Some(errno) => {
                let jump = Jump {
                    errno,
                    agent: self.rpcs.agent().to_owned(),
                    server: self.rpcs.name().to_owned(),
                    func: self.func.to_owned(),
                };
                policy::fire(&jump);
                Err(jump)
            }
        }
    }
}

impl<O> Drop for Completed<'_, O> {
    fn drop(&mut self) {
        self.log_line();
    }
}
