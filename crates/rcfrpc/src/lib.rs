//! # rcfrpc
//!
//! The engine side of remote procedure calls into servers that run on
//! test agents. A test names a server by agent and server name, gets an
//! `RpcServer` handle for it, and calls functions through the handle; the
//! runtime times every call, traces it, validates what came back and
//! decides whether a failure should end the test.
//!
//! ## Architecture
//!
//! - **Engine**: owns the `Transport` and the `Configurator`, creates and
//!   restarts servers, and hands out `RpcServer` handles.
//! - **RpcServer**: one handle per remote server. It carries the session,
//!   the sequence number, the next-call knobs, the deferred-call slot and
//!   the diagnostics of the last call.
//! - **Completed**: the outcome of one call, validated by the `check_*`
//!   wrappers and `finish`ed into the output record or a `Jump`.
//! - **Loopback**: an in-process agent implementing both seams, for tests.
//!
//! ## Invariants
//!
//! - **One in flight**: a handle runs at most one call at a time, and holds
//!   at most one deferred call.
//! - **Poisoning**: after a timeout or a lost server, every call fails
//!   until the handle is restarted.
//! - **Knobs are one-shot**: next-call settings revert after every call,
//!   whatever its outcome.

pub mod builtin;
pub mod call;
pub mod check;
pub mod conf;
pub mod config;
pub mod deferred;
pub mod engine;
pub mod lifecycle;
pub mod logbuf;
pub mod logging;
pub mod loopback;
pub mod namespace;
pub mod policy;
pub mod reinit;
pub mod server;
pub mod transport;

#[cfg(test)]
mod tests;

pub use call::Completed;
pub use call::is_call_ok;
pub use check::Check;
pub use check::WaitStatus;
pub use conf::Configurator;
pub use conf::MemoryConfigurator;
pub use config::EngineConfig;
pub use deferred::Pending;
pub use engine::CreateFlags;
pub use engine::Engine;
pub use logbuf::LogBuf;
pub use logbuf::LogBufPool;
pub use loopback::Loopback;
pub use loopback::Outcome;
pub use loopback::Stop;
pub use policy::Jump;
pub use policy::JumpPolicy;
pub use policy::Source;
pub use policy::clear_jump_hook;
pub use policy::set_jump_hook;
pub use reinit::init_or_reuse;
pub use rpcwire::CallMode;
pub use rpcwire::Errno;
pub use rpcwire::Module;
pub use rpcwire::RpcPtr;
pub use rpcwire::TeErrno;
pub use server::KnobGuard;
pub use server::Knobs;
pub use server::Monitor;
pub use server::RpcServer;
pub use transport::ServerId;
pub use transport::Transport;
