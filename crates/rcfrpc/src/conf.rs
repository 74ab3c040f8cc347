//! # Configurator Access
//!
//! The configurator is a hierarchical key/value tree shared by the engine
//! and the agents. Keys are object paths such as
//! `/agent:ta1/rpcserver:pco/sid:`; every segment is `subid:instance`.
//!
//! The runtime only needs a handful of operations, so the tree is reached
//! through the `Configurator` trait. `MemoryConfigurator` keeps the tree in
//! a `DashMap` and is what the loopback agent builds on.

use async_trait::async_trait;
use dashmap::DashMap;

use rpcwire::Errno;
use rpcwire::Module;
use rpcwire::TeErrno;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The key does not exist.
    NotFound(String),
    /// The key already exists.
    Exists(String),
    /// The tree refused the change.
    Rejected(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound(key) => write!(f, "no such instance: {}", key),
            Error::Exists(key) => write!(f, "instance already exists: {}", key),
            Error::Rejected(msg) => write!(f, "change rejected: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for TeErrno {
    fn from(e: Error) -> Self {
        let errno = match e {
            Error::NotFound(_) => Errno::NoEntry,
            Error::Exists(_) => Errno::Exists,
            Error::Rejected(_) => Errno::InvalidArgument,
        };
        TeErrno::new(Module::ConfApi, errno)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Access to the configuration tree.
#[async_trait]
pub trait Configurator: Send + Sync + 'static {
    /// Returns the value of `key`, or `None` if the instance does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Creates `key` with `value`. Fails with `Exists` if it is present.
    async fn add(&self, key: &str, value: &str) -> Result<()>;

    /// Sets `key`, creating it when absent.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Deletes `key` and everything below it. Fails with `NotFound` if absent.
    async fn del(&self, key: &str) -> Result<()>;

    /// Lists the keys matching `pattern`, where an instance of `*` matches
    /// any instance name of that segment.
    async fn find(&self, pattern: &str) -> Result<Vec<String>>;
}

/// `/agent:<ta>/rpcserver:<name>`
pub fn server_key(agent: &str, name: &str) -> String {
    format!("/agent:{}/rpcserver:{}", agent, name)
}

/// `/agent:<ta>/rpcserver:<name>/<leaf>:`
pub fn server_leaf(agent: &str, name: &str, leaf: &str) -> String {
    format!("/agent:{}/rpcserver:{}/{}:", agent, name, leaf)
}

/// The instance name of the last segment of `key`.
pub fn instance_name(key: &str) -> &str {
    let last = key.rsplit('/').next().unwrap_or(key);
    last.split_once(':').map_or("", |(_, inst)| inst)
}

/// Splits `/agent:<ta>/rpcserver:<name>` into `(ta, name)`.
pub fn parse_server_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix("/agent:")?;
    let (agent, rest) = rest.split_once('/')?;
    let name = rest.strip_prefix("rpcserver:")?;
    if name.contains('/') || name.is_empty() || agent.is_empty() {
        return None;
    }
    Some((agent, name))
}

/// Segment-wise match of `key` against `pattern`.
pub fn matches(pattern: &str, key: &str) -> bool {
    let mut pat = pattern.split('/');
    let mut seg = key.split('/');
    loop {
        match (pat.next(), seg.next()) {
            (None, None) => return true,
            (Some(p), Some(s)) => {
                let (p_sub, p_inst) = p.split_once(':').unwrap_or((p, ""));
                let (s_sub, s_inst) = s.split_once(':').unwrap_or((s, ""));
                if p_sub != s_sub || (p_inst != "*" && p_inst != s_inst) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// An in-memory configuration tree.
#[derive(Debug, Default)]
pub struct MemoryConfigurator {
    tree: DashMap<String, String>,
}

impl MemoryConfigurator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous read, for callers that already hold the tree.
    pub fn value(&self, key: &str) -> Option<String> {
        self.tree.get(key).map(|v| v.value().clone())
    }

    /// Number of instances in the tree.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[async_trait]
impl Configurator for MemoryConfigurator {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.value(key))
    }

    async fn add(&self, key: &str, value: &str) -> Result<()> {
        match self.tree.entry(key.to_owned()) {
            dashmap::Entry::Occupied(_) => Err(Error::Exists(key.to_owned())),
            dashmap::Entry::Vacant(slot) => {
                slot.insert(value.to_owned());
                Ok(())
            }
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.tree.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        if self.tree.remove(key).is_none() {
            return Err(Error::NotFound(key.to_owned()));
        }
        let prefix = format!("{}/", key);
        self.tree.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn find(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .tree
            .iter()
            .filter(|entry| matches(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_helpers() {
        assert_eq!(server_key("ta", "pco"), "/agent:ta/rpcserver:pco");
        assert_eq!(server_leaf("ta", "pco", "sid"), "/agent:ta/rpcserver:pco/sid:");
        assert_eq!(instance_name("/agent:ta/rpcserver:pco"), "pco");
        assert_eq!(instance_name("/agent:ta/rpcserver:pco/sid:"), "");
        assert_eq!(parse_server_key("/agent:ta/rpcserver:pco"), Some(("ta", "pco")));
        assert_eq!(parse_server_key("/agent:ta/rpcserver:pco/sid:"), None);
        assert_eq!(parse_server_key("/agent:ta/rpc_default_timeout:"), None);
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches("/agent:*/rpcserver:*", "/agent:ta/rpcserver:pco"));
        assert!(matches("/agent:ta/rpcserver:*", "/agent:ta/rpcserver:pco"));
        assert!(!matches("/agent:tb/rpcserver:*", "/agent:ta/rpcserver:pco"));
        assert!(!matches("/agent:*/rpcserver:*", "/agent:ta/rpcserver:pco/sid:"));
        assert!(!matches("/agent:*/rpcserver:*", "/agent:ta"));
    }

    #[tokio::test]
    async fn test_memory_tree() -> anyhow::Result<()> {
        let conf = MemoryConfigurator::new();
        conf.add("/agent:ta/rpcserver:pco", "").await?;
        conf.set("/agent:ta/rpcserver:pco/sid:", "4").await?;
        conf.add("/agent:ta/rpcserver:child", "fork_pco").await?;

        assert_eq!(
            conf.add("/agent:ta/rpcserver:pco", "x").await,
            Err(Error::Exists("/agent:ta/rpcserver:pco".into()))
        );
        assert_eq!(conf.get("/agent:ta/rpcserver:pco/sid:").await?, Some("4".into()));
        assert_eq!(conf.find("/agent:ta/rpcserver:*").await?.len(), 2);

        conf.del("/agent:ta/rpcserver:pco").await?;
        assert_eq!(conf.get("/agent:ta/rpcserver:pco/sid:").await?, None);
        assert_eq!(conf.len(), 1);
        assert!(matches!(conf.del("/agent:ta/rpcserver:pco").await, Err(Error::NotFound(_))));
        Ok(())
    }
}
