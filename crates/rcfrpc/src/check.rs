//! # Retval Validators
//!
//! Each wrapper asserts the shape of what the remote function returned
//! before handing it back. A value outside its contract stamps the call
//! with `TAPI-ECORRUPTED` and is replaced by the contract's error value; a
//! value inside the contract's error range marks the call as an IUT
//! failure, which the jump policy then judges.
//!
//! On top of every check sits the errno-change test: a call that claims
//! success but changed the remote errno is corrupted too, unless the
//! handle's next-call knobs switched that test off.
//!
//! In `Deferred` mode nothing has been returned yet, so every check yields
//! a neutral value.

use rpcpack::Pack;
use rpcpack::Unpack;
use rpcwire::CallMode;
use rpcwire::Errno;
use rpcwire::Module;
use rpcwire::RpcPtr;
use rpcwire::TeErrno;
use tracing::error;

use crate::call::Completed;

/// The fixed set of integer contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// `-1` on failure, anything non-negative otherwise.
    GeMinusOne,
    /// `0` or `-1`.
    ZeroOrMinusOne,
    /// `0`, or negative on failure.
    ZeroOrNegative,
    /// `0`, or a negated module-coded errno on failure.
    ZeroOrNegErrno,
    /// `0` or `1`.
    Bool,
    /// Inside `[low, high]`; `error` is the failure value.
    Range { low: i64, high: i64, error: i64 },
}

impl Check {
    /// The value is outside the contract altogether.
    pub fn violated(self, value: i64) -> bool {
        match self {
            Check::GeMinusOne => value < -1,
            Check::ZeroOrMinusOne => value != 0 && value != -1,
            Check::ZeroOrNegative | Check::ZeroOrNegErrno => value > 0,
            Check::Bool => value != 0 && value != 1,
            Check::Range { low, high, .. } => value < low || value > high,
        }
    }

    /// The value reports a failure of the function.
    pub fn err_cond(self, value: i64) -> bool {
        match self {
            Check::GeMinusOne | Check::ZeroOrMinusOne => value == -1,
            Check::ZeroOrNegative | Check::ZeroOrNegErrno => value < 0,
            Check::Bool => false,
            Check::Range { error, .. } => value == error,
        }
    }

    /// What the wrapper returns when the call cannot be trusted.
    pub fn error_value(self) -> i64 {
        match self {
            Check::GeMinusOne | Check::ZeroOrMinusOne | Check::ZeroOrNegative => -1,
            Check::ZeroOrNegErrno => i64::from(TeErrno::new(Module::Tapi, Errno::Corrupted).to_neg()),
            Check::Bool => 0,
            Check::Range { error, .. } => error,
        }
    }
}

/// How a remote child ended, as `waitpid` reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pack, Unpack)]
pub enum WaitStatus {
    Exited(i32),
    Signaled(i32),
    Stopped(i32),
    #[default]
    Unknown,
}

impl<O> Completed<'_, O> {
    /// Validates an integer retval against `check`, returning what the
    /// wrapper should hand back.
    pub fn check_int(&mut self, check: Check, value: i64) -> i64 {
        if self.mode == CallMode::Deferred {
            return 0;
        }
        if !self.is_call_ok() || self.errno.is(Errno::Unsupported) {
            self.fail_iut();
            return check.error_value();
        }
        if check.violated(value) {
            error!("Function {}() returned incorrect value {}", self.func, value);
            self.corrupt();
            return check.error_value();
        }
        if check.err_cond(value) {
            self.errno_changed = false;
            self.fail_iut();
            return value;
        }
        if self.errno_check && self.errno_changed {
            error!("Function {}() returned correct value {}, but changed errno to {}", self.func, value, self.errno);
            self.corrupt();
            return check.error_value();
        }
        value
    }

    /// Validates a returned pointer. Null is a failure unless `null_ok`.
    pub fn check_ptr(&mut self, ptr: RpcPtr, null_ok: bool) -> RpcPtr {
        if self.mode == CallMode::Deferred {
            return RpcPtr::NULL;
        }
        if !self.is_call_ok() || self.errno.is(Errno::Unsupported) {
            self.fail_iut();
            return RpcPtr::NULL;
        }
        if ptr.is_null() {
            self.errno_changed = false;
            if !null_ok {
                self.fail_iut();
            }
            return ptr;
        }
        if self.errno_check && self.errno_changed {
            error!("Function {}() returned correct value {}, but changed errno to {}", self.func, ptr, self.errno);
            self.corrupt();
            return RpcPtr::NULL;
        }
        ptr
    }

    /// Anything but a clean exit with code 0 is a failure.
    pub fn check_wait_status(&mut self, status: WaitStatus) -> WaitStatus {
        if self.mode == CallMode::Deferred {
            return WaitStatus::Unknown;
        }
        if !self.is_call_ok() {
            self.fail_iut();
            return WaitStatus::Unknown;
        }
        if status != WaitStatus::Exited(0) {
            self.fail_iut();
        }
        status
    }

    /// For functions without a retval: only the errno-change test applies.
    pub fn check_void(&mut self) {
        if self.mode == CallMode::Deferred || !self.is_call_ok() {
            return;
        }
        if self.errno_check && self.errno_changed {
            error!("Function {}() that returns void changed errno to {}", self.func, self.errno);
            self.corrupt();
        }
    }
}
