//! # Pointer Namespaces
//!
//! Remote pointers carry a small namespace id telling what kind of object
//! they refer to. The names behind the ids live on the server; a handle
//! asks for each id once through `namespace_id2str` and caches the answer
//! until `free_cache` or `restart`.
//!
//! Names are needed for trace output and for `check_membership`, which
//! wrappers use to refuse pointers of the wrong kind.

use std::fmt::Write;

use rpcpack::Decoder;
use rpcpack::render::Render;
use rpcpack::render::render_fields;
use rpcwire::Errno;
use rpcwire::Module;
use rpcwire::RpcPtr;
use rpcwire::TeErrno;
use rpcwire::ptr::NS_DEFAULT;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::builtin;
use crate::builtin::NamespaceIn;
use crate::builtin::NamespaceOut;
use crate::server::RpcServer;

impl RpcServer {
    /// The name of namespace `id`, asking the server on a cache miss.
    /// The default namespace is the empty name.
    pub async fn namespace_name(&self, id: u16) -> Result<String, TeErrno> {
        self.fetch_namespace(id, true).await
    }

    async fn fetch_namespace(&self, id: u16, poison: bool) -> Result<String, TeErrno> {
        if id == NS_DEFAULT {
            return Ok(String::new());
        }
        if let Some(name) = self.cached_namespace(id) {
            return Ok(name);
        }

        let input = NamespaceIn { id };
        let raw = if poison {
            self.raw_call::<_, NamespaceOut>(builtin::NAMESPACE_ID2STR, &input, None, 0, false).await?
        } else {
            self.raw_exchange::<_, NamespaceOut>(builtin::NAMESPACE_ID2STR, &input, None, 0, false).await?
        };

        if raw.out.retval != 0 || !raw.errno.is_ok() {
            let errno = if raw.errno.is_ok() { TeErrno::new(Module::Tapi, Errno::Corrupted) } else { raw.errno };
            warn!("RPC {} namespace_id2str({}) -> {} ({})", self, id, raw.out.retval, errno);
            return Err(errno);
        }

        let name = raw.out.name;
        let mut st = self.lock();
        let slot = usize::from(id);
        if st.namespaces.len() <= slot {
            st.namespaces.resize(slot + 1, None);
        }
        st.namespaces[slot] = Some(name.clone());
        debug!("RPC {} namespace {} is '{}'", self, id, name);
        Ok(name)
    }

    pub fn cached_namespace(&self, id: u16) -> Option<String> {
        self.lock().namespaces.get(usize::from(id)).cloned().flatten()
    }

    /// Forgets every cached namespace name.
    pub fn free_cache(&self) {
        self.lock().namespaces.clear();
    }

    /// Fails with `TAPI-EWRONGPTR` unless `ptr` lives in namespace
    /// `expected`. A null pointer belongs everywhere.
    pub async fn check_membership(&self, ptr: RpcPtr, expected: &str) -> Result<(), TeErrno> {
        if ptr.is_null() {
            return Ok(());
        }

        let name = self.namespace_name(ptr.ns).await?;
        if name != expected {
            error!(
                "RPC {}: pointer {:#x} is from namespace '{}', expected '{}'",
                self, ptr.value, name, expected
            );
            return Err(TeErrno::new(Module::Tapi, Errno::WrongPtr));
        }
        Ok(())
    }

    /// Looks up every namespace referenced by `records` that is not cached.
    /// Failures only cost the trace its names and never poison the handle.
    pub(crate) async fn resolve_namespaces(&self, records: &[&[u8]]) {
        let mut ids = Vec::new();
        for record in records {
            pointer_namespaces(record, &mut ids);
        }
        for id in ids {
            if self.cached_namespace(id).is_some() {
                continue;
            }
            if let Err(errno) = self.fetch_namespace(id, false).await {
                debug!("RPC {} cannot name namespace {}: {}", self, id, errno);
            }
        }
    }
}

/// Renders an encoded record for a trace line, naming pointers from `cache`.
pub(crate) fn render_record(bytes: &[u8], out: &mut String, cache: &[Option<String>]) {
    // a unit record is an empty argument list
    if rpcpack::from_bytes::<()>(bytes).is_ok() {
        return;
    }
    let mut hook = PtrNames { cache };
    if render_fields(bytes, out, &mut hook).is_err() {
        out.clear();
        let _ = write!(out, "<{} undecodable bytes>", bytes.len());
    }
}

/// Collects the non-default namespace ids of the pointers in `bytes`.
pub(crate) fn pointer_namespaces(bytes: &[u8], ids: &mut Vec<u16>) {
    let mut scratch = String::new();
    let _ = render_fields(bytes, &mut scratch, &mut PtrIds(ids));
}

struct PtrIds<'a>(&'a mut Vec<u16>);

impl Render for PtrIds<'_> {
    fn union(&mut self, name: &str, mut payload: Decoder<'_>, _out: &mut String) -> bool {
        if name != RpcPtr::CASE {
            return false;
        }
        if let Ok(ptr) = RpcPtr::from_payload(&mut payload) {
            if !ptr.is_null() && ptr.ns != NS_DEFAULT && !self.0.contains(&ptr.ns) {
                self.0.push(ptr.ns);
            }
        }
        true
    }
}

struct PtrNames<'a> {
    cache: &'a [Option<String>],
}

impl Render for PtrNames<'_> {
    fn union(&mut self, name: &str, mut payload: Decoder<'_>, out: &mut String) -> bool {
        if name != RpcPtr::CASE {
            return false;
        }
        let Ok(ptr) = RpcPtr::from_payload(&mut payload) else {
            return false;
        };
        let known = self.cache.get(usize::from(ptr.ns)).and_then(|n| n.as_deref());
        write_ptr(out, ptr, known);
        true
    }
}

/// `NULL`, `0x1000` in the default namespace, `name(0x1000)` when the
/// namespace is known and `ns(0x1000)` when it is not.
pub fn write_ptr(out: &mut String, ptr: RpcPtr, namespace: Option<&str>) {
    if ptr.is_null() {
        out.push_str("NULL");
        return;
    }
    let _ = match namespace {
        _ if ptr.ns == NS_DEFAULT => write!(out, "{:#x}", ptr.value),
        Some(name) => write!(out, "{}(0x{:x})", name, ptr.value),
        None => write!(out, "{}", ptr),
    };
}

#[cfg(test)]
mod tests {
    use rpcpack::Pack;
    use rpcpack::to_bytes;

    use super::*;

    #[derive(Debug, Default, Pack)]
    struct Burst {
        pool: RpcPtr,
        bufs: Vec<RpcPtr>,
        n: u32,
    }

    #[test]
    fn test_pointer_namespaces_are_collected_once() {
        let burst = Burst {
            pool: RpcPtr::new(0x10, 2),
            bufs: vec![RpcPtr::new(0x20, 3), RpcPtr::new(0x30, 3), RpcPtr::NULL, RpcPtr::new(0x40, 0)],
            n: 4,
        };
        let bytes = to_bytes(&burst).unwrap();
        let mut ids = Vec::new();
        pointer_namespaces(&bytes, &mut ids);
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_pointers_render_with_cached_names() {
        let burst = Burst {
            pool: RpcPtr::new(0x10, 2),
            bufs: vec![RpcPtr::new(0x20, 3), RpcPtr::NULL, RpcPtr::new(0x40, 0)],
            n: 3,
        };
        let bytes = to_bytes(&burst).unwrap();
        let cache = vec![None, None, Some("rte_mempool".to_owned())];
        let mut out = String::new();
        render_record(&bytes, &mut out, &cache);
        assert_eq!(out, "pool=rte_mempool(0x10), bufs=[3(0x20), NULL, 0x40], n=3");
    }

    #[test]
    fn test_unit_renders_empty() {
        let mut out = String::new();
        render_record(&to_bytes(&()).unwrap(), &mut out, &[]);
        assert_eq!(out, "");
    }

    #[test]
    fn test_undecodable_record() {
        let mut out = String::from("partial");
        render_record(&[0xff, 0x00], &mut out, &[]);
        assert_eq!(out, "<2 undecodable bytes>");
    }
}
