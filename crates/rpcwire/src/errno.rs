//! # Module-Coded Errno
//!
//! A `TeErrno` is a 32-bit word: the top byte names the `Module` the error
//! came from, the low 24 bits carry an API-neutral `Errno` code. Zero in the
//! code bits means success whatever the module bits say.
//!
//! ## Neg-errno
//!
//! Wrappers that signal failure kernel-style return the word negated in the
//! retval slot. `TeErrno::to_neg` and `TeErrno::from_neg` convert between
//! the two forms.

const MODULE_SHIFT: u32 = 24;
const CODE_MASK: u32 = (1 << MODULE_SHIFT) - 1;

/// Generates the `Errno` enum and its lookup tables from one list.
macro_rules! errno_table {
    ($($(#[$doc:meta])* $variant:ident = $code:literal => $name:literal;)*) => {
        /// API-neutral error codes. POSIX codes keep their Linux numbers;
        /// harness-specific codes start at 1000.
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Errno {
            $($(#[$doc])* $variant = $code,)*
        }

        impl Errno {
            /// Looks a numeric code up.
            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(Errno::$variant),)*
                    _ => None,
                }
            }

            /// Symbolic name, e.g. `ENOENT`.
            pub fn name(self) -> &'static str {
                match self {
                    $(Errno::$variant => $name,)*
                }
            }
        }
    };
}

errno_table! {
    PermissionDenied = 1 => "EPERM";
    NoEntry = 2 => "ENOENT";
    Io = 5 => "EIO";
    TooBig = 7 => "E2BIG";
    BadFd = 9 => "EBADF";
    Again = 11 => "EAGAIN";
    NoMemory = 12 => "ENOMEM";
    Fault = 14 => "EFAULT";
    Busy = 16 => "EBUSY";
    Exists = 17 => "EEXIST";
    InvalidArgument = 22 => "EINVAL";
    NoSys = 38 => "ENOSYS";
    NoData = 61 => "ENODATA";
    Proto = 71 => "EPROTO";
    MsgSize = 90 => "EMSGSIZE";
    NotSupported = 95 => "EOPNOTSUPP";
    ConnReset = 104 => "ECONNRESET";
    NoBufs = 105 => "ENOBUFS";
    TimedOut = 110 => "ETIMEDOUT";
    Already = 114 => "EALREADY";
    InProgress = 115 => "EINPROGRESS";
    /// Generic failure without a better code.
    Fail = 1000 => "EFAIL";
    /// A returned value or record violated its contract.
    Corrupted = 1001 => "ECORRUPTED";
    /// The function is not compiled into the RPC server.
    Unsupported = 1002 => "ERPCNOTSUPP";
    /// A remote pointer belongs to another namespace.
    WrongPtr = 1003 => "EWRONGPTR";
    /// A caller-supplied buffer is too small.
    SmallBuf = 1004 => "ESMALLBUF";
    /// The RPC server process is gone.
    RpcDead = 1005 => "ERPCDEAD";
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The subsystem that produced an error.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Module {
    Unspec = 0,
    /// Agent control channel.
    Rcf = 1,
    /// Engine side of the agent control API.
    RcfApi = 2,
    /// The engine-side RPC runtime.
    RcfRpc = 3,
    /// The remote function, i.e. the library under test.
    Rpc = 4,
    /// RPC server infrastructure on the agent.
    Rpcs = 5,
    /// Test API wrappers and validators.
    Tapi = 6,
    /// Transport between engine and agent.
    Comm = 7,
    /// Configurator client.
    ConfApi = 8,
}

impl Module {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Module::Unspec),
            1 => Some(Module::Rcf),
            2 => Some(Module::RcfApi),
            3 => Some(Module::RcfRpc),
            4 => Some(Module::Rpc),
            5 => Some(Module::Rpcs),
            6 => Some(Module::Tapi),
            7 => Some(Module::Comm),
            8 => Some(Module::ConfApi),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Module::Unspec => "",
            Module::Rcf => "RCF",
            Module::RcfApi => "RCF_API",
            Module::RcfRpc => "RCF_RPC",
            Module::Rpc => "RPC",
            Module::Rpcs => "RPCS",
            Module::Tapi => "TAPI",
            Module::Comm => "COMM",
            Module::ConfApi => "CONF_API",
        }
    }
}

/// A module-coded error word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TeErrno(u32);

impl TeErrno {
    pub const OK: TeErrno = TeErrno(0);

    pub const fn new(module: Module, errno: Errno) -> Self {
        Self(((module as u32) << MODULE_SHIFT) | errno as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The code bits without the module.
    pub const fn code(self) -> u32 {
        self.0 & CODE_MASK
    }

    pub const fn is_ok(self) -> bool {
        self.code() == 0
    }

    pub fn module(self) -> Option<Module> {
        Module::from_u8((self.0 >> MODULE_SHIFT) as u8)
    }

    pub fn errno(self) -> Option<Errno> {
        Errno::from_code(self.code())
    }

    /// Whether the code bits equal `errno`, ignoring the module.
    pub fn is(self, errno: Errno) -> bool {
        self.code() == errno as u32
    }

    /// Re-stamps the code with another module. Success stays zero.
    pub fn with_module(self, module: Module) -> Self {
        if self.is_ok() {
            return Self::OK;
        }
        Self(((module as u32) << MODULE_SHIFT) | self.code())
    }

    /// The word negated for the retval slot.
    pub fn to_neg(self) -> i32 {
        (self.0 as i32).wrapping_neg()
    }

    /// Reads a neg-errno retval back. Non-negative values are not errors.
    pub fn from_neg(retval: i64) -> Option<Self> {
        if retval >= 0 {
            return None;
        }
        u32::try_from(retval.unsigned_abs()).ok().map(Self)
    }
}

impl From<Errno> for TeErrno {
    fn from(errno: Errno) -> Self {
        Self::new(Module::Unspec, errno)
    }
}

impl std::fmt::Display for TeErrno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_ok() {
            return f.write_str("OK");
        }
        match self.module() {
            Some(m) if m != Module::Unspec => write!(f, "{}-", m.name())?,
            Some(_) => {}
            None => write!(f, "{:#x}-", self.0 >> MODULE_SHIFT)?,
        }
        match self.errno() {
            Some(e) => f.write_str(e.name()),
            None => write!(f, "{}", self.code()),
        }
    }
}

impl std::fmt::Debug for TeErrno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TeErrno({})", self)
    }
}

impl std::error::Error for TeErrno {}
