//! Client side of each subcommand.

use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, chdir, dup2, execve, fork};
use tracing::{debug, info, warn};

use crate::cgroup::{CgroupManager, remove_cgroup};
use crate::config::{Config, image_name};
use crate::entity::{
    CgroupConfig, Container, ContainerStatus, WaitRequest, new_id, now_millis, resolve, short_id,
};
use crate::error::{Error, Result};
use crate::namespace::join_namespaces;
use crate::network::Network;
use crate::rootfs::{self, RootfsLayout, TarArchive};
use crate::rpc::{DaemonClient, daemon_running};
use crate::runtime::{self, LaunchSpec, Mode, cstring};
use crate::terminal;

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const MONTH_MS: i64 = 30 * DAY_MS;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub image: PathBuf,
    pub command: Vec<String>,
    pub interactive: bool,
    pub detach: bool,
    pub memory: Option<String>,
    pub cpu: Option<String>,
    pub env: Vec<String>,
    pub network: Option<String>,
}

pub fn daemon_client(config: &Config) -> DaemonClient {
    DaemonClient::new(config.socket_path())
}

/// Starts a container and, unless detached, waits for it. Returns the
/// exit code to leave with.
pub fn run(config: &Config, options: &RunOptions) -> Result<i32> {
    let mode = Mode::from_flags(options.interactive, options.detach)?;
    if options.command.is_empty() {
        return Err(Error::MalformedArgs("no command given".to_string()));
    }
    if let Some(bad) = options.env.iter().find(|e| !e.contains('=')) {
        return Err(Error::MalformedArgs(format!("env {bad:?} is not KEY=VALUE")));
    }

    let daemon = daemon_client(config);
    let daemon_up = daemon_running(&config.pid_path());
    if !daemon_up {
        if mode == Mode::Detached || options.network.is_some() {
            return Err(Error::IllegalServerStatus(
                "detached runs and networks need the daemon, start it with `tiny-docker daemon`"
                    .to_string(),
            ));
        }
        warn!("daemon is not running, the container will not be tracked");
    }

    let image = image_name(&options.image)?;
    let id = new_id();
    let layout = RootfsLayout::new(config, &image, &id);
    rootfs::prepare(&layout, &options.image, &TarArchive)?;

    let spec = LaunchSpec {
        container_id: id.clone(),
        layout,
        command: options.command.clone(),
        env: options.env.clone(),
        mode,
        log_file: (mode == Mode::Detached).then(|| config.container_log(&id)),
    };
    let mut launched = runtime::launch(&spec)?;
    let pid = launched.pid();

    if let Err(e) = register(config, &daemon, daemon_up, options, &image, &id, pid) {
        // The child must be gone before its cgroup can be removed.
        if let Err(abort) = launched.abort() {
            warn!(pid, error = %abort, "failed to reap aborted container");
        }
        if daemon_up {
            if let Err(stop) = daemon.stop(&id, None) {
                debug!(error = %stop, "failed to report aborted container");
            }
        }
        remove_cgroup(&config.cgroup, &id);
        return Err(e);
    }
    launched.release()?;

    if mode == Mode::Detached {
        daemon.wait(&WaitRequest {
            container_id: id.clone(),
            pid,
        })?;
        println!("{id}");
        return Ok(0);
    }

    ignore_interrupts();
    let relayed = match launched.take_pty() {
        Some(master) => terminal::relay(master),
        None => Ok(()),
    };
    let code = launched.wait()?;
    info!(id = short_id(&id), code, "container exited");
    finish(config, &daemon, daemon_up, &id);
    relayed?;
    Ok(code)
}

/// Cgroup limits and daemon bookkeeping while the child is still parked.
fn register(
    config: &Config,
    daemon: &DaemonClient,
    daemon_up: bool,
    options: &RunOptions,
    image: &str,
    id: &str,
    pid: i32,
) -> Result<()> {
    let mut cgroup = CgroupManager::new(&config.cgroup, id)?;
    cgroup.apply(&CgroupConfig {
        memory_limit: options.memory.clone(),
        cpu_shares: options.cpu.clone(),
    })?;
    cgroup.add_pid(pid)?;
    cgroup.sync()?;

    if !daemon_up {
        return Ok(());
    }
    daemon.run(&Container::new(
        id.to_string(),
        pid,
        image.to_string(),
        options.command.join(" "),
    ))?;
    if let Some(network) = &options.network {
        let endpoint = daemon.network_connect(network, id, pid)?;
        info!(network = %network, ip = %endpoint.ip, "container connected");
    }
    Ok(())
}

fn finish(config: &Config, daemon: &DaemonClient, daemon_up: bool, id: &str) {
    if daemon_up {
        if let Err(e) = daemon.stop(id, Some(now_millis())) {
            warn!(id, error = %e, "failed to report container exit");
        }
    } else {
        remove_cgroup(&config.cgroup, id);
    }
}

/// The container shares our terminal; let it take ^C and ^\ alone.
fn ignore_interrupts() {
    for sig in [Signal::SIGINT, Signal::SIGQUIT] {
        if let Err(e) = unsafe { signal(sig, SigHandler::SigIgn) } {
            debug!(signal = %sig, error = %e, "failed to ignore signal");
        }
    }
}

pub fn ps(config: &Config, all: bool) -> Result<String> {
    let containers = daemon_client(config).ps(all)?;
    Ok(format_ps(&containers, now_millis()))
}

pub fn format_ps(containers: &[Container], now: i64) -> String {
    let mut rows = vec![[
        "CONTAINER ID".to_string(),
        "IMAGE".to_string(),
        "COMMAND".to_string(),
        "CREATED".to_string(),
        "STATUS".to_string(),
        "NAMES".to_string(),
    ]];
    for c in containers {
        rows.push([
            short_id(&c.id).to_string(),
            c.image.clone(),
            format!("\"{}\"", c.command),
            time_ago(now, c.created_at),
            status_text(c, now),
            c.name.clone(),
        ]);
    }

    let mut widths = [0usize; 6];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    for row in &rows {
        let mut line = String::new();
        for (i, cell) in row.iter().enumerate() {
            if i + 1 == row.len() {
                line.push_str(cell);
            } else {
                line.push_str(&format!("{cell:<width$}  ", width = widths[i]));
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("{n} {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

/// "3 minutes", or `None` past a month.
fn span(elapsed: i64) -> Option<String> {
    let elapsed = elapsed.max(0);
    match elapsed {
        e if e < MINUTE_MS => Some("a few seconds".to_string()),
        e if e < HOUR_MS => Some(plural(e / MINUTE_MS, "minute")),
        e if e < DAY_MS => Some(plural(e / HOUR_MS, "hour")),
        e if e < MONTH_MS => Some(plural(e / DAY_MS, "day")),
        _ => None,
    }
}

fn date(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| millis.to_string())
}

pub fn time_ago(now: i64, then: i64) -> String {
    match span(now - then) {
        Some(span) => format!("{span} ago"),
        None => date(then),
    }
}

fn status_text(container: &Container, now: i64) -> String {
    match container.status {
        ContainerStatus::Running => match span(now - container.created_at) {
            Some(span) => format!("Up {span}"),
            None => format!("Up since {}", date(container.created_at)),
        },
        ContainerStatus::Exited => {
            let exit_at = container.exit_at.unwrap_or(container.created_at);
            format!("Exited (0) {}", time_ago(now, exit_at))
        }
    }
}

pub fn stop(config: &Config, ids: &[String]) -> Result<()> {
    let daemon = daemon_client(config);
    for id in ids {
        daemon.stop(id, Some(now_millis()))?;
        println!("{id}");
    }
    Ok(())
}

pub fn logs(config: &Config, id: &str) -> Result<String> {
    daemon_client(config).logs(id)
}

pub fn commit(config: &Config, id: &str, dst: &Path) -> Result<PathBuf> {
    let dst = std::path::absolute(dst)?;
    daemon_client(config).commit(id, &dst.to_string_lossy())?;
    Ok(dst)
}

/// Looks a container up through the daemon by id, name or id prefix.
pub fn find_container(config: &Config, key: &str) -> Result<Container> {
    let containers = daemon_client(config).ps(true)?;
    resolve(&containers, key).cloned()
}

pub fn format_networks(networks: &[Network]) -> String {
    let mut out = format!("{:<16}{:<34}{:<20}{}\n", "NAME", "ID", "SUBNET", "GATEWAY");
    for n in networks {
        out.push_str(&format!(
            "{:<16}{:<34}{:<20}{}\n",
            n.name,
            n.id,
            n.ip_net.to_string(),
            n.gateway
        ));
    }
    out
}

/// Runs `command` inside a running container's namespaces and waits.
pub fn exec(config: &Config, key: &str, command: &[String], interactive: bool) -> Result<i32> {
    if command.is_empty() {
        return Err(Error::MalformedArgs("no command given".to_string()));
    }
    let container = find_container(config, key)?;
    if !container.is_running() {
        return Err(Error::ExecCommand(format!(
            "container {} is not running",
            short_id(&container.id)
        )));
    }

    let environ = read_environ(container.pid)?;
    let path_var = environ
        .iter()
        .find_map(|e| e.strip_prefix("PATH="))
        .unwrap_or("/bin:/usr/bin")
        .to_string();
    let env = environ
        .iter()
        .map(|e| cstring(e))
        .collect::<Result<Vec<CString>>>()?;
    let args = command
        .iter()
        .map(|a| cstring(a))
        .collect::<Result<Vec<CString>>>()?;
    let stdin = if interactive {
        None
    } else {
        Some(fs::File::open("/dev/null")?)
    };

    join_namespaces(container.pid)?;
    // The joined pid namespace only applies to children.
    match unsafe { fork() }? {
        ForkResult::Child => {
            exec_child(&command[0], &path_var, &args, &env, stdin.as_ref());
            unsafe { libc::_exit(127) };
        }
        ForkResult::Parent { child } => {
            ignore_interrupts();
            loop {
                match waitpid(child, None)? {
                    WaitStatus::Exited(_, code) => return Ok(code),
                    WaitStatus::Signaled(_, sig, _) => return Ok(128 + sig as i32),
                    _ => continue,
                }
            }
        }
    }
}

fn exec_child(
    program: &str,
    path_var: &str,
    args: &[CString],
    env: &[CString],
    stdin: Option<&fs::File>,
) {
    use std::os::unix::io::AsRawFd;

    if let Some(stdin) = stdin {
        if let Err(e) = dup2(stdin.as_raw_fd(), libc::STDIN_FILENO) {
            eprintln!("exec: redirect stdin: {e}");
            return;
        }
    }
    if let Err(e) = chdir("/") {
        eprintln!("exec: chdir: {e}");
        return;
    }
    let Some(path) = lookup_path(program, path_var) else {
        eprintln!("exec: {program}: command not found");
        return;
    };
    let Ok(path) = cstring(&path.to_string_lossy()) else {
        return;
    };
    let Err(e) = execve(&path, args, env);
    eprintln!("exec: {program}: {e}");
}

/// Resolves `program` against a `PATH` value, as a shell would.
pub fn lookup_path(program: &str, path_var: &str) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }
    path_var
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| candidate.is_file())
}

fn read_environ(pid: i32) -> Result<Vec<String>> {
    let raw = fs::read(format!("/proc/{pid}/environ"))
        .map_err(|e| Error::from(e).wrap(&format!("read environment of {pid}")))?;
    Ok(raw
        .split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| String::from_utf8_lossy(entry).into_owned())
        .collect())
}
