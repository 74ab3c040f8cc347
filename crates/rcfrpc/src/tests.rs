//! Tests for the call runtime against the loopback agent.

use std::sync::Arc;
use std::time::Duration;

use rpcpack::Encoder;
use rpcpack::Pack;
use rpcpack::Unpack;
use rpcwire::CallMode;
use rpcwire::Errno;
use rpcwire::Module;
use rpcwire::RpcFrame;
use rpcwire::RpcPtr;
use rpcwire::TeErrno;
use tokio::sync::Notify;

use crate::builtin;
use crate::check::Check;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::loopback::Loopback;
use crate::loopback::Outcome;
use crate::policy::JumpPolicy;
use crate::server::RpcServer;
use crate::transport;
use crate::transport::ServerId;
use crate::transport::Transport;

#[derive(Debug, Default, Pack, Unpack)]
struct AddIn {
    a: i32,
    b: i32,
}

#[derive(Debug, Default, Pack, Unpack)]
struct RetOut {
    retval: i64,
}

#[derive(Debug, Default, Pack, Unpack)]
struct PtrOut {
    ptr: RpcPtr,
}

#[derive(Debug, Default, Pack, Unpack)]
struct SleepIn {
    secs: u64,
}

fn loopback() -> Arc<Loopback> {
    let lb = Arc::new(Loopback::new());
    lb.register("add", |input: AddIn| async move {
        Outcome::ok(RetOut { retval: i64::from(input.a) + i64::from(input.b) })
    });
    lb.register("sleep", |input: SleepIn| async move {
        tokio::time::sleep(Duration::from_secs(input.secs)).await;
        Outcome::ok(RetOut::default())
    });
    lb.register("noisy", |_: ()| async move { Outcome::ok(RetOut { retval: 0 }).with_errno_changed(true) });
    lb
}

fn engine(lb: &Arc<Loopback>) -> Engine {
    Engine::new(lb.clone(), lb.clone(), EngineConfig::new())
}

async fn server(lb: &Arc<Loopback>) -> anyhow::Result<RpcServer> {
    Ok(engine(lb).create("ta", "pco_iut").await?)
}

fn rcf_rpc(errno: Errno) -> TeErrno {
    TeErrno::new(Module::RcfRpc, errno)
}

async fn add(rpcs: &RpcServer, a: i32, b: i32) -> TeErrno {
    let done = rpcs.call::<_, RetOut>("add", &AddIn { a, b }).await;
    done.errno()
}

#[tokio::test]
async fn test_immediate_call_commits_reply() -> anyhow::Result<()> {
    let lb = loopback();
    let rpcs = server(&lb).await?;

    let out = rpcs.call::<_, RetOut>("add", &AddIn { a: 2, b: 3 }).await.finish()?;
    assert_eq!(out.retval, 5);
    assert_eq!(rpcs.seq(), 1);
    assert_eq!(rpcs.errno(), TeErrno::OK);
    assert_eq!(rpcs.last_func(), "add");
    assert_eq!(rpcs.last_op(), CallMode::Immediate);
    assert!(!rpcs.timed_out());

    rpcs.call::<_, RetOut>("add", &AddIn { a: 1, b: 1 }).await.finish()?;
    assert_eq!(rpcs.seq(), 2);
    assert_eq!(rpcs.monitor().seq(), 2);
    Ok(())
}

#[tokio::test]
async fn test_unknown_function_is_unsupported() -> anyhow::Result<()> {
    let lb = loopback();
    let rpcs = server(&lb).await?;

    let mut done = rpcs.call::<_, RetOut>("frobnicate", &()).await;
    assert_eq!(done.errno(), TeErrno::new(Module::Rpc, Errno::Unsupported));
    assert!(done.is_call_ok());

    let retval = done.out.retval;
    assert_eq!(done.check_int(Check::GeMinusOne, retval), -1);
    let jump = done.finish().unwrap_err();
    assert_eq!(jump.errno, TeErrno::new(Module::Rpc, Errno::Unsupported));
    assert_eq!(jump.func, "frobnicate");
    Ok(())
}

#[tokio::test]
async fn test_knobs_revert_after_each_call() -> anyhow::Result<()> {
    let lb = loopback();
    let rpcs = server(&lb).await?;

    rpcs.set_timeout(Duration::from_secs(1));
    rpcs.set_policy(JumpPolicy::AwaitAny);
    rpcs.set_start(42);
    assert_ne!(rpcs.knobs(), rpcs.default_knobs());

    add(&rpcs, 1, 2).await;
    assert_eq!(rpcs.knobs(), rpcs.default_knobs());

    // knobs are consumed by failed calls too
    rpcs.set_policy(JumpPolicy::AwaitAny);
    rpcs.set_op(CallMode::Complete);
    assert_eq!(add(&rpcs, 1, 2).await, rcf_rpc(Errno::Already));
    assert_eq!(rpcs.knobs(), rpcs.default_knobs());
    assert_eq!(rpcs.op(), CallMode::Immediate);
    Ok(())
}

#[tokio::test]
async fn test_knob_guard_restores_on_drop() -> anyhow::Result<()> {
    let lb = loopback();
    let rpcs = server(&lb).await?;

    {
        let _iut = rpcs.await_iut_error();
        let _quiet = rpcs.silent();
        assert_eq!(rpcs.knobs().policy, JumpPolicy::AwaitIutOnly);
        assert!(rpcs.knobs().silent);
    }
    assert_eq!(rpcs.knobs(), rpcs.default_knobs());

    rpcs.set_silent_default(true);
    assert!(rpcs.knobs().silent);
    add(&rpcs, 1, 1).await;
    assert!(rpcs.knobs().silent);
    Ok(())
}

#[tokio::test]
async fn test_timeout_with_margin() -> anyhow::Result<()> {
    let lb = loopback();
    let rpcs = server(&lb).await?;
    assert_eq!(rpcs.default_timeout(), Duration::from_secs(10));

    rpcs.set_timeout_with_margin(Duration::from_secs(30));
    assert_eq!(rpcs.knobs().timeout, Some(Duration::from_secs(40)));

    rpcs.set_timeout_with_margin(Duration::ZERO);
    assert_eq!(rpcs.knobs().timeout, Some(Duration::from_secs(10)));
    Ok(())
}

#[tokio::test]
async fn test_sequence_number_wraps() -> anyhow::Result<()> {
    let lb = loopback();
    let rpcs = server(&lb).await?;

    rpcs.lock().seq = u16::MAX;
    assert_eq!(add(&rpcs, 1, 1).await, TeErrno::OK);
    assert_eq!(rpcs.seq(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timeout_poisons_until_restart() -> anyhow::Result<()> {
    let lb = loopback();
    let rpcs = server(&lb).await?;

    rpcs.set_timeout(Duration::from_secs(5));
    let done = rpcs.call::<_, RetOut>("sleep", &SleepIn { secs: 3600 }).await;
    assert_eq!(done.errno(), rcf_rpc(Errno::TimedOut));
    assert!(done.finish().is_err());
    assert!(rpcs.timed_out());
    assert_eq!(rpcs.seq(), 0);

    assert_eq!(add(&rpcs, 1, 1).await, rcf_rpc(Errno::TimedOut));
    assert_eq!(rpcs.seq(), 0);
    assert!(!rpcs.is_alive().await);

    rpcs.restart().await?;
    assert!(!rpcs.timed_out());
    assert_eq!(add(&rpcs, 1, 1).await, TeErrno::OK);
    Ok(())
}

#[tokio::test]
async fn test_lost_server_poisons() -> anyhow::Result<()> {
    let lb = loopback();
    let rpcs = server(&lb).await?;

    assert!(lb.kill("ta", "pco_iut"));
    assert_eq!(add(&rpcs, 1, 1).await, rcf_rpc(Errno::RpcDead));
    assert!(rpcs.timed_out());
    assert_eq!(add(&rpcs, 1, 1).await, rcf_rpc(Errno::TimedOut));
    Ok(())
}

#[tokio::test]
async fn test_deferred_call_lifecycle() -> anyhow::Result<()> {
    let lb = loopback();
    let gate = Arc::new(Notify::new());
    let opened = gate.clone();
    lb.register("long_op", move |_: ()| {
        let opened = opened.clone();
        async move {
            opened.notified().await;
            Outcome::ok(RetOut { retval: 7 })
        }
    });
    let rpcs = server(&lb).await?;

    assert_eq!(rpcs.is_op_done().await, Err(rcf_rpc(Errno::Already)));

    rpcs.set_op(CallMode::Deferred);
    let mut done = rpcs.call::<_, RetOut>("long_op", &()).await;
    assert_eq!(done.errno(), TeErrno::OK);
    assert_eq!(done.check_int(Check::GeMinusOne, 123), 0);
    done.finish()?;

    let pending = rpcs.pending().expect("deferred call is pending");
    assert_eq!(pending.func, "long_op");
    assert_ne!(pending.jobid, 0);
    assert!(!rpcs.is_op_done().await?);

    // a second call is refused and the slot survives
    assert_eq!(add(&rpcs, 1, 1).await, rcf_rpc(Errno::Busy));
    assert!(rpcs.pending().is_some());
    assert!(!rpcs.timed_out());

    gate.notify_one();
    let mut finished = false;
    for _ in 0..100 {
        if rpcs.is_op_done().await? {
            finished = true;
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(finished);

    rpcs.set_op(CallMode::Complete);
    let out = rpcs.call::<_, RetOut>("long_op", &()).await.finish()?;
    assert_eq!(out.retval, 7);
    assert!(rpcs.pending().is_none());
    assert_eq!(rpcs.last_op(), CallMode::Complete);
    Ok(())
}

#[tokio::test]
async fn test_complete_of_another_function_is_refused() -> anyhow::Result<()> {
    let lb = loopback();
    let rpcs = server(&lb).await?;

    rpcs.set_op(CallMode::Deferred);
    assert_eq!(add(&rpcs, 1, 2).await, TeErrno::OK);

    rpcs.set_op(CallMode::Complete);
    let done = rpcs.call::<_, RetOut>("sleep", &()).await;
    assert_eq!(done.errno(), rcf_rpc(Errno::PermissionDenied));
    drop(done);
    assert!(rpcs.pending().is_some());

    rpcs.set_op(CallMode::Complete);
    let out = rpcs.call::<_, RetOut>("add", &()).await.finish()?;
    assert_eq!(out.retval, 3);
    Ok(())
}

#[tokio::test]
async fn test_errno_change_on_success() -> anyhow::Result<()> {
    let lb = loopback();
    let rpcs = server(&lb).await?;
    let corrupted = TeErrno::new(Module::Tapi, Errno::Corrupted);

    let mut done = rpcs.call::<_, RetOut>("noisy", &()).await;
    assert!(done.errno_changed());
    assert_eq!(done.check_int(Check::ZeroOrMinusOne, 0), -1);
    assert_eq!(done.errno(), corrupted);
    assert_eq!(rpcs.errno(), corrupted);
    assert_eq!(done.finish().unwrap_err().errno, corrupted);

    let _unchecked = rpcs.no_errno_check();
    let mut done = rpcs.call::<_, RetOut>("noisy", &()).await;
    assert_eq!(done.check_int(Check::ZeroOrMinusOne, 0), 0);
    assert!(done.finish().is_ok());
    Ok(())
}

#[tokio::test]
async fn test_pointer_namespaces() -> anyhow::Result<()> {
    let lb = loopback();
    let mempool = lb.register_namespace("rte_mempool");
    lb.register("mempool_create", move |_: ()| async move {
        Outcome::ok(PtrOut { ptr: RpcPtr::new(0x1000, mempool) })
    });
    let rpcs = server(&lb).await?;

    let mut done = rpcs.call::<_, PtrOut>("mempool_create", &()).await;
    let ptr = done.out.ptr;
    assert_eq!(done.check_ptr(ptr, false), ptr);
    done.finish()?;

    // the trace already asked for the name, without advancing seq
    assert_eq!(rpcs.cached_namespace(mempool).as_deref(), Some("rte_mempool"));
    assert_eq!(rpcs.seq(), 1);

    rpcs.check_membership(ptr, "rte_mempool").await?;
    assert_eq!(
        rpcs.check_membership(ptr, "rte_mbuf").await,
        Err(TeErrno::new(Module::Tapi, Errno::WrongPtr))
    );
    rpcs.check_membership(RpcPtr::NULL, "rte_mbuf").await?;

    assert_eq!(rpcs.namespace_name(0).await?, "");
    assert_eq!(rpcs.namespace_name(77).await, Err(TeErrno::new(Module::Rpc, Errno::NoEntry)));

    rpcs.free_cache();
    assert_eq!(rpcs.cached_namespace(mempool), None);
    assert_eq!(rpcs.namespace_name(mempool).await?, "rte_mempool");
    Ok(())
}

#[tokio::test]
async fn test_null_pointer_is_an_iut_failure() -> anyhow::Result<()> {
    let lb = loopback();
    lb.register("mempool_lookup", |_: ()| async move { Outcome::err(PtrOut::default(), Errno::NoEntry) });
    let rpcs = server(&lb).await?;

    let _iut = rpcs.await_iut_error();
    let mut done = rpcs.call::<_, PtrOut>("mempool_lookup", &()).await;
    let ptr = done.out.ptr;
    assert!(done.check_ptr(ptr, false).is_null());
    assert!(done.failed());
    assert!(!done.errno_changed());
    assert!(done.finish().is_ok());
    assert_eq!(rpcs.errno(), TeErrno::new(Module::Rpc, Errno::NoEntry));
    Ok(())
}

#[tokio::test]
async fn test_log_buffers_return_to_pool() -> anyhow::Result<()> {
    let lb = loopback();
    let rpcs = server(&lb).await?;
    let pool = rpcs.engine().logbufs().clone();

    let before = pool.idle();
    add(&rpcs, 2, 2).await;
    assert!(pool.idle() >= before);
    assert!(pool.idle() > 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_call_is_refused() -> anyhow::Result<()> {
    let lb = loopback();
    let rpcs = server(&lb).await?;

    let slow = async {
        rpcs.call::<_, RetOut>("sleep", &SleepIn { secs: 1 }).await.errno()
    };
    let second = async {
        rpcs.set_op(CallMode::Deferred);
        rpcs.set_timeout(Duration::from_secs(7));
        let done = rpcs.call::<_, RetOut>("add", &AddIn { a: 1, b: 1 }).await;
        let seen = (done.errno(), rpcs.errno(), rpcs.op(), rpcs.knobs().timeout);
        drop(done);
        seen
    };
    let (slow, (errno, handle_errno, op, timeout)) = tokio::join!(slow, second);

    assert_eq!(slow, TeErrno::OK);
    assert_eq!(errno, rcf_rpc(Errno::Busy));
    assert_eq!(handle_errno, rcf_rpc(Errno::Busy));
    assert_eq!(op, CallMode::Immediate);
    assert_eq!(timeout, None);

    // the refused call left nothing behind for the next one
    assert_eq!(rpcs.errno(), TeErrno::OK);
    assert_eq!(add(&rpcs, 1, 1).await, TeErrno::OK);
    assert!(rpcs.pending().is_none());
    assert!(!rpcs.timed_out());
    Ok(())
}

/// An output record `{retval=0, extra=[[...]]}` nested `levels` deep.
struct DeepOut {
    levels: usize,
}

impl Pack for DeepOut {
    fn pack(&self, enc: &mut Encoder) -> rpcpack::Result<()> {
        enc.record_begin()?;
        enc.field_begin("retval")?;
        enc.i64(0)?;
        enc.field_end()?;
        enc.field_begin("extra")?;
        for _ in 0..self.levels {
            enc.list_begin()?;
        }
        for _ in 0..self.levels {
            enc.list_end()?;
        }
        enc.field_end()?;
        enc.record_end()
    }
}

#[tokio::test]
async fn test_deeply_nested_reply_is_traced_as_undecodable() -> anyhow::Result<()> {
    let lb = loopback();
    lb.register("deep", |_: ()| async move { Outcome::ok(DeepOut { levels: 200_000 }) });
    let rpcs = server(&lb).await?;

    let done = rpcs.call::<_, RetOut>("deep", &()).await;
    assert_eq!(done.errno(), TeErrno::OK);
    assert!(done.out_text.starts_with('<'));
    assert!(done.out_text.ends_with("undecodable bytes>"));
    let out = done.finish()?;
    assert_eq!(out.retval, 0);
    assert_eq!(add(&rpcs, 1, 1).await, TeErrno::OK);
    Ok(())
}

/// Forwards to the loopback, except for the calls it tampers with:
/// `garbled` gets a reply whose errno does not decode, answering
/// `seq + seq_shift`, and namespace lookups time out.
struct Tampering {
    lb: Arc<Loopback>,
    seq_shift: u16,
}

#[async_trait::async_trait]
impl Transport for Tampering {
    async fn exchange(&self, server: &ServerId, request: &[u8], deadline: Duration) -> transport::Result<Vec<u8>> {
        let (func, seq) = match RpcFrame::decode(request) {
            Ok(RpcFrame::Call(call)) => (call.header.func.to_owned(), call.header.seq),
            _ => return self.lb.exchange(server, request, deadline).await,
        };
        match func.as_str() {
            "garbled" => garbled_reply(seq.wrapping_add(self.seq_shift)).map_err(|e| transport::Error::Io(e.to_string())),
            builtin::NAMESPACE_ID2STR => Err(transport::Error::Timeout),
            _ => self.lb.exchange(server, request, deadline).await,
        }
    }
}

fn garbled_reply(seq: u16) -> rpcpack::Result<Vec<u8>> {
    let mut enc = Encoder::new();
    enc.union_begin("Reply")?;
    enc.record_begin()?;
    enc.field_begin("seq")?;
    enc.u16(seq)?;
    enc.field_end()?;
    enc.field_begin("errno")?;
    enc.str("EOK")?;
    enc.field_end()?;
    enc.record_end()?;
    enc.union_end()?;
    enc.into_bytes()
}

async fn tampered(lb: &Arc<Loopback>, seq_shift: u16) -> anyhow::Result<RpcServer> {
    let transport = Arc::new(Tampering { lb: lb.clone(), seq_shift });
    let engine = Engine::new(transport, lb.clone(), EngineConfig::new());
    Ok(engine.create("ta", "pco_iut").await?)
}

#[tokio::test]
async fn test_undecodable_reply_reports_its_seq() -> anyhow::Result<()> {
    let lb = loopback();

    let rpcs = tampered(&lb, 0).await?;
    let done = rpcs.call::<_, RetOut>("garbled", &()).await;
    assert_eq!(done.errno(), rcf_rpc(Errno::Proto));
    drop(done);

    let rpcs = tampered(&lb, 1).await?;
    let done = rpcs.call::<_, RetOut>("garbled", &()).await;
    assert_eq!(done.errno(), rcf_rpc(Errno::Corrupted));
    drop(done);

    assert!(!rpcs.timed_out());
    assert_eq!(rpcs.seq(), 0);
    assert_eq!(add(&rpcs, 1, 1).await, TeErrno::OK);
    Ok(())
}

#[tokio::test]
async fn test_trace_lookup_timeout_does_not_poison() -> anyhow::Result<()> {
    let lb = loopback();
    let mempool = lb.register_namespace("rte_mempool");
    lb.register("mempool_create", move |_: ()| async move {
        Outcome::ok(PtrOut { ptr: RpcPtr::new(0x1000, mempool) })
    });
    let rpcs = tampered(&lb, 0).await?;

    let out = rpcs.call::<_, PtrOut>("mempool_create", &()).await.finish()?;
    assert_eq!(out.ptr, RpcPtr::new(0x1000, mempool));
    assert_eq!(rpcs.cached_namespace(mempool), None);
    assert!(!rpcs.timed_out());
    assert_eq!(add(&rpcs, 1, 1).await, TeErrno::OK);

    // an explicit lookup is a call of its own and does poison
    assert_eq!(rpcs.namespace_name(mempool).await, Err(rcf_rpc(Errno::TimedOut)));
    assert!(rpcs.timed_out());
    Ok(())
}
