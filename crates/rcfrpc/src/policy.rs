//! # Failure Dispatch
//!
//! A call can fail for two reasons: the library under test reported an
//! error (an IUT error), or something around it broke (transport, timeout,
//! corrupted record, validator mismatch). The handle's `JumpPolicy` decides
//! which of the two abort the test.
//!
//! | Policy          | IUT error | Other error |
//! |-----------------|-----------|-------------|
//! | `AwaitNone`     | jump      | jump        |
//! | `AwaitIutOnly`  | surface   | jump        |
//! | `AwaitAny`      | surface   | surface     |
//!
//! A jump is the `Err(Jump)` side of a wrapper's result, so test code
//! unwinds with `?`. Test frameworks that need to observe jumps as they
//! happen can install a per-thread hook with `set_jump_hook`.

use std::cell::RefCell;

use rpcwire::TeErrno;

/// Which failures leave the test through a jump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum JumpPolicy {
    /// Every failure jumps.
    #[default]
    AwaitNone,
    /// IUT errors are returned to the caller, the rest jump.
    AwaitIutOnly,
    /// Nothing jumps.
    AwaitAny,
}

/// Where a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The library under test.
    Iut,
    /// The RPC layer, the transport or a validator.
    NonIut,
}

impl JumpPolicy {
    pub fn jumps_on(self, source: Source) -> bool {
        match (self, source) {
            (JumpPolicy::AwaitNone, _) => true,
            (JumpPolicy::AwaitIutOnly, Source::NonIut) => true,
            (JumpPolicy::AwaitIutOnly, Source::Iut) => false,
            (JumpPolicy::AwaitAny, _) => false,
        }
    }
}

/// The non-local exit out of a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jump {
    pub errno: TeErrno,
    pub agent: String,
    pub server: String,
    pub func: String,
}

impl std::fmt::Display for Jump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC ({},{}) {}() failed: {}", self.agent, self.server, self.func, self.errno)
    }
}

impl std::error::Error for Jump {}

type JumpHook = Box<dyn Fn(&Jump)>;

thread_local! {
    static JUMP_HOOK: RefCell<Option<JumpHook>> = const { RefCell::new(None) };
}

/// Installs `hook` for jumps taken on this thread, returning the previous one.
pub fn set_jump_hook(hook: impl Fn(&Jump) + 'static) -> Option<Box<dyn Fn(&Jump)>> {
    JUMP_HOOK.with(|slot| slot.replace(Some(Box::new(hook))))
}

/// Removes this thread's jump hook.
pub fn clear_jump_hook() -> Option<Box<dyn Fn(&Jump)>> {
    JUMP_HOOK.with(|slot| slot.take())
}

pub(crate) fn fire(jump: &Jump) {
    // the hook is taken out while it runs so it may reinstall itself
    let hook = JUMP_HOOK.with(|slot| slot.take());
    if let Some(hook) = hook {
        hook(jump);
        JUMP_HOOK.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;
    use std::cell::Cell;

    use rpcwire::Errno;
    use rpcwire::Module;

    use super::*;

    #[test]
    fn test_policy_table() {
        assert!(JumpPolicy::AwaitNone.jumps_on(Source::Iut));
        assert!(JumpPolicy::AwaitNone.jumps_on(Source::NonIut));
        assert!(!JumpPolicy::AwaitIutOnly.jumps_on(Source::Iut));
        assert!(JumpPolicy::AwaitIutOnly.jumps_on(Source::NonIut));
        assert!(!JumpPolicy::AwaitAny.jumps_on(Source::Iut));
        assert!(!JumpPolicy::AwaitAny.jumps_on(Source::NonIut));
        assert_eq!(JumpPolicy::default(), JumpPolicy::AwaitNone);
    }

    #[test]
    fn test_hook_fires_per_thread() {
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        set_jump_hook(move |_| counter.set(counter.get() + 1));

        let jump = Jump {
            errno: TeErrno::new(Module::Rpc, Errno::NoEntry),
            agent: "ta".into(),
            server: "pco".into(),
            func: "open".into(),
        };
        fire(&jump);
        fire(&jump);
        assert_eq!(seen.get(), 2);

        std::thread::spawn(move || fire(&jump)).join().unwrap();
        assert_eq!(seen.get(), 2);

        assert!(clear_jump_hook().is_some());
        assert!(clear_jump_hook().is_none());
    }
}
