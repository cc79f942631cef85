//! The long-lived daemon: container bookkeeping, networks, and the socket
//! that serves them.

pub mod handlers;
pub mod monitor;
pub mod state;

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;

use nix::unistd::setsid;
use tracing::{info, warn};

use crate::cgroup::remove_cgroup;
use crate::config::Config;
use crate::entity::WaitRequest;
use crate::error::{Error, Result};
use crate::network::driver::NetworkDriver;
use crate::network::{BridgeDriver, Networks};
use crate::rpc::{Server, daemon_running};

use self::state::ContainerStore;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct DaemonContext {
    pub config: Arc<Config>,
    pub containers: Arc<ContainerStore>,
    pub networks: Arc<Networks>,
}

impl DaemonContext {
    /// Opens the stores under the configured root. Blocking.
    pub fn open(config: Config, driver: Box<dyn NetworkDriver>) -> Result<Self> {
        Ok(Self {
            containers: Arc::new(ContainerStore::open(config.state_dir())?),
            networks: Arc::new(Networks::open(&config, driver)?),
            config: Arc::new(config),
        })
    }

    /// Stops a container and, on the transition to exited, gives back its
    /// network address and cgroup.
    pub async fn stop_container(&self, id: &str, exit_at: Option<i64>) -> Result<bool> {
        if !self.containers.stop(id, exit_at).await? {
            return Ok(false);
        }

        let networks = Arc::clone(&self.networks);
        let container_id = id.to_string();
        match blocking(move || networks.disconnect(&container_id)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(id, error = %e, "failed to disconnect container"),
        }
        remove_cgroup(&self.config.cgroup, id);
        Ok(true)
    }

    /// Puts every container still recorded as running back under watch.
    pub fn resume_monitors(&self) -> Result<usize> {
        let running = self.containers.running()?;
        for container in &running {
            monitor::spawn(
                self.clone(),
                WaitRequest {
                    container_id: container.id.clone(),
                    pid: container.pid,
                },
            );
        }
        Ok(running.len())
    }
}

/// Runs blocking store or netlink work off the async workers.
pub async fn blocking<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::ExecCommand(format!("blocking task failed: {e}")))?
}

pub async fn serve(config: Config) -> Result<()> {
    let socket = config.socket_path();
    let pid_file = config.pid_path();
    let ctx = blocking(move || DaemonContext::open(config, Box::new(BridgeDriver))).await?;

    let server = Server::new(socket, pid_file, handlers::registry(ctx.clone()));
    let listener = server.bind()?;
    let resumed = ctx.resume_monitors()?;
    info!(resumed, "daemon ready");
    server.serve(listener).await
}

/// Runs the daemon in this process until it is killed.
pub fn serve_foreground(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

/// Re-executes the binary as a detached daemon in its own session with
/// output in the daemon log. `args` are the global flags to pass on.
pub fn spawn_detached(config: &Config, args: &[String]) -> Result<u32> {
    if daemon_running(&config.pid_path()) {
        return Err(Error::IllegalServerStatus(
            "daemon is already running".to_string(),
        ));
    }

    let log_path = config.daemon_log();
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir)?;
    }
    let log = OpenOptions::new().create(true).append(true).open(&log_path)?;

    let mut command = Command::new("/proc/self/exe");
    command
        .args(args)
        .args(["daemon", "--foreground"])
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log);
    unsafe {
        command.pre_exec(|| setsid().map(|_| ()).map_err(io::Error::from));
    }
    let child = command.spawn()?;
    info!(pid = child.id(), log = %log_path.display(), "daemon started");
    Ok(child.id())
}
