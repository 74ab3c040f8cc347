//! # Log-Buffer Pool
//!
//! Trace lines are composed in scratch strings that are handed back to a
//! small shared pool instead of being freed. A `LogBuf` returns its string
//! when dropped, so every path out of a call releases what it took.
//!
//! The printers here render flag words and enums for those lines.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

const INITIAL_CAPACITY: usize = 256;

/// A shared free list of scratch strings.
#[derive(Debug, Clone)]
pub struct LogBufPool {
    free: Arc<Mutex<Vec<String>>>,
    capacity: usize,
}

impl LogBufPool {
    /// A pool that keeps at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> Self {
        Self { free: Arc::new(Mutex::new(Vec::with_capacity(capacity))), capacity }
    }

    /// Takes an empty buffer, reusing an idle one when possible.
    pub fn take(&self) -> LogBuf {
        let reused = self.free.lock().unwrap_or_else(PoisonError::into_inner).pop();
        LogBuf {
            buf: reused.unwrap_or_else(|| String::with_capacity(INITIAL_CAPACITY)),
            pool: self.clone(),
        }
    }

    /// Number of buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn give_back(&self, mut buf: String) {
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.capacity {
            free.push(buf);
        }
    }
}

/// A scratch string on loan from a `LogBufPool`.
pub struct LogBuf {
    buf: String,
    pool: LogBufPool,
}

impl LogBuf {
    pub fn as_str(&self) -> &str {
        &self.buf
    }
}

impl std::ops::Deref for LogBuf {
    type Target = String;

    fn deref(&self) -> &String {
        &self.buf
    }
}

impl std::ops::DerefMut for LogBuf {
    fn deref_mut(&mut self) -> &mut String {
        &mut self.buf
    }
}

impl std::fmt::Display for LogBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.buf)
    }
}

impl std::fmt::Debug for LogBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LogBuf({:?})", self.buf)
    }
}

impl Drop for LogBuf {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}

/// Appends `value` as `A|B|0x40`: named bits first, in table order, then
/// whatever is left in hex. Zero renders as `0`.
pub fn write_bitmask(out: &mut String, value: u64, names: &[(u64, &str)]) {
    if value == 0 {
        out.push('0');
        return;
    }

    let mut rest = value;
    let mut first = true;
    for &(bits, name) in names {
        if bits != 0 && rest & bits == bits {
            if !first {
                out.push('|');
            }
            first = false;
            out.push_str(name);
            rest &= !bits;
        }
    }
    if rest != 0 {
        if !first {
            out.push('|');
        }
        let _ = write!(out, "{:#x}", rest);
    }
}

/// Appends the name of `value`, or the number if it has none.
pub fn write_enum(out: &mut String, value: i64, names: &[(i64, &str)]) {
    match names.iter().find(|(v, _)| *v == value) {
        Some((_, name)) => out.push_str(name),
        None => {
            let _ = write!(out, "{}", value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: &[(u64, &str)] = &[(0x1, "POLLIN"), (0x4, "POLLOUT"), (0x8, "POLLERR")];

    #[test]
    fn test_buffers_are_recycled() {
        let pool = LogBufPool::new(2);
        {
            let mut a = pool.take();
            let mut b = pool.take();
            let mut c = pool.take();
            a.push_str("a");
            b.push_str("b");
            c.push_str("c");
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 2);

        let reused = pool.take();
        assert!(reused.is_empty());
        assert!(reused.capacity() >= INITIAL_CAPACITY);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_bitmask() {
        let mut out = String::new();
        write_bitmask(&mut out, 0x1 | 0x8, POLL);
        assert_eq!(out, "POLLIN|POLLERR");

        out.clear();
        write_bitmask(&mut out, 0x4 | 0x40, POLL);
        assert_eq!(out, "POLLOUT|0x40");

        out.clear();
        write_bitmask(&mut out, 0, POLL);
        assert_eq!(out, "0");

        out.clear();
        write_bitmask(&mut out, 0x100, POLL);
        assert_eq!(out, "0x100");
    }

    #[test]
    fn test_enum() {
        let families = &[(2, "AF_INET"), (10, "AF_INET6")];
        let mut out = String::new();
        write_enum(&mut out, 10, families);
        out.push(' ');
        write_enum(&mut out, 17, families);
        assert_eq!(out, "AF_INET6 17");
    }
}
