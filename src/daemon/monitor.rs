//! Watches detached containers, which are not children of the daemon, by
//! probing their pid until it is gone.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::DaemonContext;
use crate::entity::WaitRequest;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Zero-signal probe. EPERM still means the process exists.
pub fn is_alive(pid: i32) -> bool {
    pid > 0 && matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

pub fn spawn(ctx: DaemonContext, request: WaitRequest) -> JoinHandle<()> {
    tokio::spawn(watch(ctx, request, POLL_INTERVAL))
}

/// Polls until the process is gone, then runs the same transition as an
/// explicit stop.
pub async fn watch(ctx: DaemonContext, request: WaitRequest, interval: Duration) {
    debug!(id = %request.container_id, pid = request.pid, "watching container");
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if !is_alive(request.pid) {
            break;
        }
    }

    match ctx.stop_container(&request.container_id, None).await {
        Ok(true) => info!(id = %request.container_id, "detached container exited"),
        Ok(false) => debug!(id = %request.container_id, "container already stopped"),
        Err(e) => error!(id = %request.container_id, error = %e, "failed to record container exit"),
    }
}
