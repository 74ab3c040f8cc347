//! Handle lifecycle: children, restart, destroy, and the procedures that
//! change what runs behind a handle.

use std::time::Duration;

use rpcwire::Errno;
use rpcwire::Module;
use rpcwire::TeErrno;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::builtin;
use crate::builtin::CreateProcessIn;
use crate::builtin::CreateProcessOut;
use crate::builtin::ExecveIn;
use crate::builtin::RetvalOut;
use crate::builtin::SetlibnameIn;
use crate::conf;
use crate::engine::CreateFlags;
use crate::engine::validate;
use crate::server::Knobs;
use crate::server::RpcServer;

/// `execve` waits as long as the transport allows.
const EXECVE_TIMEOUT: Duration = Duration::from_millis(0xFFFF_FFFF);
const CREATE_PROCESS_TIMEOUT: Duration = Duration::from_millis(1000);

impl RpcServer {
    /// Forks a child server named `name`.
    pub async fn fork(&self, name: &str) -> Result<RpcServer, TeErrno> {
        self.engine.get(self.agent(), name, Some(self.name()), CreateFlags::empty()).await
    }

    /// Forks a child server that execs the server image.
    pub async fn fork_exec(&self, name: &str) -> Result<RpcServer, TeErrno> {
        self.engine.get(self.agent(), name, Some(self.name()), CreateFlags::EXEC).await
    }

    /// Starts a thread of this server as a new server.
    pub async fn thread(&self, name: &str) -> Result<RpcServer, TeErrno> {
        self.engine.get(self.agent(), name, Some(self.name()), CreateFlags::THREAD).await
    }

    /// Has this server spawn a process, then registers it as server `name`.
    /// Only `CreateFlags::EXEC` is meaningful in `flags`.
    pub async fn create_process(&self, name: &str, flags: CreateFlags) -> Result<RpcServer, TeErrno> {
        let register = CreateFlags::REGISTER | (flags & CreateFlags::EXEC);
        validate(name, Some(self.name()), register)?;

        let input = CreateProcessIn { name: name.to_owned(), flags: flags.bits() };
        let raw = self
            .raw_call::<_, CreateProcessOut>(builtin::CREATE_PROCESS, &input, Some(CREATE_PROCESS_TIMEOUT), 0, false)
            .await?;

        if raw.out.pid < 0 {
            let errno = if raw.errno.is_ok() { TeErrno::new(Module::RcfApi, Errno::Corrupted) } else { raw.errno };
            error!("RPC {} create_process({}) -> {} ({})", self, name, raw.out.pid, errno);
            return Err(errno);
        }
        info!("RPC {} create_process({}) -> {} (OK)", self, name, raw.out.pid);

        self.engine.get(self.agent(), name, Some(self.name()), register).await
    }

    /// Replaces the session behind the handle. The dynamic library selected
    /// with `setlibname` is selected again. The handle is unusable if this
    /// fails.
    pub async fn restart(&self) -> Result<(), TeErrno> {
        let session = self
            .engine
            .establish(self.agent(), self.name(), None, CreateFlags::empty())
            .await
            .inspect_err(|e| error!("Failed to restart RPC server {}: {}", self, e))?;

        let libname = {
            let mut st = self.lock();
            st.sid = session.sid;
            st.seq = 0;
            st.op = Default::default();
            let silent = st.silent_default;
            st.next = Knobs::defaults(silent);
            st.deferred = None;
            st.namespaces.clear();
            st.timed_out = false;
            st.dead = false;
            st.finished = false;
            st.settle_local(TeErrno::OK);
            st.libname.clone()
        };
        info!("RPC server {} restarted, sid {}", self, session.sid);

        if let Some(libname) = libname {
            self.setlibname(Some(&libname)).await?;
        }
        Ok(())
    }

    /// Stops the server and releases the handle. Remote resources are
    /// released even when the configurator reports a failure.
    pub async fn destroy(self) -> Result<(), TeErrno> {
        let key = conf::server_key(self.agent(), self.name());
        let result: Result<(), TeErrno> = match self.engine.conf().del(&key).await {
            Ok(()) | Err(conf::Error::NotFound(_)) => Ok(()),
            Err(e) => {
                error!("Failed to delete RPC server {}: {}", self, e);
                Err(e.into())
            }
        };
        self.free_cache();
        result
    }

    /// The next restart or destroy kills the server instead of asking it
    /// to exit.
    pub async fn mark_dead(&self) -> Result<(), TeErrno> {
        let key = conf::server_leaf(self.agent(), self.name(), "dead");
        self.engine.conf().set(&key, "1").await?;
        self.lock().dead = true;
        Ok(())
    }

    /// The server process is already gone; nothing is left to stop.
    pub async fn mark_finished(&self) -> Result<(), TeErrno> {
        let key = conf::server_leaf(self.agent(), self.name(), "finished");
        self.engine.conf().set(&key, "1").await?;
        self.lock().finished = true;
        Ok(())
    }

    /// Whether some other server is a thread of this one.
    pub async fn has_children(&self) -> Result<bool, TeErrno> {
        let conf = self.engine.conf();
        let thread = format!("thread_{}", self.name());
        let pattern = format!("/agent:{}/rpcserver:*", self.agent());

        for key in conf.find(&pattern).await? {
            if conf.get(&key).await?.as_deref() == Some(thread.as_str()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Liveness probe. Allowed while a deferred call is pending.
    pub async fn is_alive(&self) -> bool {
        match self.raw_call::<(), ()>(builtin::IS_ALIVE, &(), None, 0, true).await {
            Ok(raw) => {
                self.settle_raw(&raw);
                if raw.errno.is_ok() {
                    info!("RPC server {} is alive", self.name());
                    return true;
                }
                warn!("RPC server {} is not alive: {}", self.name(), raw.errno);
                false
            }
            Err(errno) => {
                self.lock().settle_local(errno);
                warn!("RPC server {} is not alive: {}", self.name(), errno);
                false
            }
        }
    }

    /// Selects the dynamic library under test; `None` selects the one the
    /// server started with. Remembered across restarts.
    pub async fn setlibname(&self, libname: Option<&str>) -> Result<(), TeErrno> {
        let shown = libname.unwrap_or("(NULL)");
        let input = SetlibnameIn { libname: libname.map(str::to_owned) };

        let raw = match self.raw_call::<_, RetvalOut>(builtin::SETLIBNAME, &input, None, 0, true).await {
            Ok(raw) => raw,
            Err(errno) => {
                self.lock().settle_local(errno);
                error!("RPC ({},{}) setlibname({}) failed: {}", self.agent(), self.name(), shown, errno);
                return Err(errno);
            }
        };
        self.settle_raw(&raw);

        if raw.out.retval != 0 {
            let errno = if raw.errno.is_ok() { TeErrno::new(Module::Tapi, Errno::Corrupted) } else { raw.errno };
            error!("RPC ({},{}) setlibname({}) -> {} ({})", self.agent(), self.name(), shown, raw.out.retval, errno);
            return Err(errno);
        }

        info!("RPC ({},{}) setlibname({}) -> 0 (OK)", self.agent(), self.name(), shown);
        self.lock().libname = libname.map(str::to_owned);
        Ok(())
    }

    /// Execs the server image in place. Threads of the old image are marked
    /// finished, and this server no longer counts as a thread of anything.
    pub async fn execve(&self) -> Result<(), TeErrno> {
        let input = ExecveIn { name: self.name().to_owned() };

        let raw = match self.raw_call::<_, ()>(builtin::EXECVE, &input, Some(EXECVE_TIMEOUT), 0, false).await {
            Ok(raw) => raw,
            Err(errno) => {
                self.lock().settle_local(errno);
                error!("RPC ({},{}): execve() failed: {}", self.agent(), self.name(), errno);
                return Err(errno);
            }
        };
        self.settle_raw(&raw);

        if !raw.errno.is_ok() {
            error!("RPC ({},{}): execve() -> ({})", self.agent(), self.name(), raw.errno);
            return Err(raw.errno);
        }
        info!("RPC ({},{}): execve() -> (OK)", self.agent(), self.name());

        self.free_cache();
        self.mark_deleted_threads().await
    }

    async fn mark_deleted_threads(&self) -> Result<(), TeErrno> {
        let conf = self.engine.conf();
        let my_key = conf::server_key(self.agent(), self.name());
        let my_value = conf.get(&my_key).await?.unwrap_or_default();
        let my_thread = format!("thread_{}", self.name());
        let pattern = format!("/agent:{}/rpcserver:*", self.agent());

        for key in conf.find(&pattern).await? {
            if key == my_key {
                continue;
            }
            let value = conf.get(&key).await?.unwrap_or_default();
            let sibling = my_value.starts_with("thread_") && value == my_value;
            if value == my_thread || sibling {
                let finished = conf::server_leaf(self.agent(), conf::instance_name(&key), "finished");
                conf.set(&finished, "1").await?;
            }
        }

        if let Some(parent) = my_value.strip_prefix("thread_") {
            conf.set(&conf::server_leaf(self.agent(), parent, "finished"), "1").await?;
        }
        conf.set(&my_key, "").await?;
        Ok(())
    }
}
