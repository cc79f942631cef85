use std::fs::File;
use std::thread;

use nix::sched::{CloneFlags, setns};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Namespaces every container gets.
pub fn container_clone_flags() -> CloneFlags {
    CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWIPC
}

/// Join order for `exec`. The mount namespace goes last so the
/// `/proc/<pid>/ns` paths stay reachable while the others are entered.
const EXEC_NAMESPACES: [(&str, CloneFlags); 5] = [
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("uts", CloneFlags::CLONE_NEWUTS),
    ("net", CloneFlags::CLONE_NEWNET),
    ("pid", CloneFlags::CLONE_NEWPID),
    ("mnt", CloneFlags::CLONE_NEWNS),
];

pub fn open_ns(pid: i32, kind: &str) -> Result<File> {
    File::open(format!("/proc/{pid}/ns/{kind}"))
        .map_err(|e| Error::from(e).wrap(&format!("open {kind} namespace of {pid}")))
}

/// Moves the calling thread into every namespace of `pid`.
///
/// The pid namespace only applies to children forked afterwards.
pub fn join_namespaces(pid: i32) -> Result<()> {
    let files = EXEC_NAMESPACES
        .iter()
        .map(|(kind, flag)| Ok((open_ns(pid, kind)?, *flag, *kind)))
        .collect::<Result<Vec<_>>>()?;

    for (file, flag, kind) in files {
        setns(&file, flag).map_err(|e| Error::ExecCommand(format!("setns {kind}: {e}")))?;
        debug!(pid, kind, "joined namespace");
    }
    Ok(())
}

/// Keeps the calling thread in another network namespace until dropped.
pub struct NetnsGuard {
    original: File,
}

impl NetnsGuard {
    pub fn enter(pid: i32) -> Result<Self> {
        let original = File::open("/proc/thread-self/ns/net")?;
        let target = open_ns(pid, "net")?;
        setns(&target, CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::Netlink(format!("enter netns of {pid}: {e}")))?;
        Ok(Self { original })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original, CloneFlags::CLONE_NEWNET) {
            error!(error = %e, "failed to restore network namespace");
        }
    }
}

/// Runs `f` inside the network namespace of `pid` on a dedicated thread,
/// so no other work ever observes the switched namespace.
pub fn with_netns<F, R>(pid: i32, f: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    let worker = thread::Builder::new()
        .name(format!("netns-{pid}"))
        .spawn(move || {
            let _guard = NetnsGuard::enter(pid)?;
            f()
        })?;
    worker
        .join()
        .map_err(|_| Error::Netlink(format!("netns worker for {pid} panicked")))?
}
