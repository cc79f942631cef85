use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::pty::openpty;
use nix::sched::clone;
use nix::sys::signal::Signal;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::sys::termios::Termios;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Pid, chdir, close, dup2, execve, read, setsid};
use tracing::{debug, error, info};

use crate::config::{
    ENV_CONTAINER_ID, ENV_DETACH, ENV_MERGE_LAYER, ENV_READ_LAYER, ENV_WORK_LAYER,
    ENV_WRITE_LAYER,
};
use crate::error::{Error, Result};
use crate::namespace::container_clone_flags;
use crate::rootfs::RootfsLayout;
use crate::terminal::window_size;

const STACK_SIZE: usize = 1024 * 1024; // 1MB stack
const SELF_EXE: &str = "/proc/self/exe";
const DEFAULT_PATH: &str = "PATH=/bin:/sbin:/usr/bin:/usr/sbin:/usr/local/bin";
const DEFAULT_TERM: &str = "TERM=xterm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Inherits the caller's stdio; the caller waits.
    Foreground,
    /// Runs on a fresh pty relayed to the caller's terminal.
    Interactive,
    /// Detached from any terminal, output goes to the container log.
    Detached,
}

impl Mode {
    pub fn from_flags(interactive: bool, detach: bool) -> Result<Self> {
        match (interactive, detach) {
            (true, true) => Err(Error::TerminalAndDetach),
            (true, false) => Ok(Self::Interactive),
            (false, true) => Ok(Self::Detached),
            (false, false) => Ok(Self::Foreground),
        }
    }
}

pub(crate) fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::MalformedArgs(format!("{s:?} contains a nul byte")))
}

/// Everything needed to start one container process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub container_id: String,
    pub layout: RootfsLayout,
    pub command: Vec<String>,
    /// User supplied `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub mode: Mode,
    pub log_file: Option<PathBuf>,
}

impl LaunchSpec {
    /// Arguments of the re-executed binary.
    pub fn init_args(&self) -> Vec<String> {
        let mut args = vec!["tiny-docker".to_string(), "init".to_string(), "--".to_string()];
        args.extend(self.command.iter().cloned());
        args
    }

    pub fn environment(&self) -> Vec<String> {
        let mut env = self.env.clone();
        let has = |env: &[String], key: &str| env.iter().any(|e| e.starts_with(key));
        if !has(&env, "PATH=") {
            env.push(DEFAULT_PATH.to_string());
        }
        if self.mode == Mode::Interactive && !has(&env, "TERM=") {
            env.push(DEFAULT_TERM.to_string());
        }
        let layout = &self.layout;
        for (key, value) in [
            (ENV_READ_LAYER, layout.read.display().to_string()),
            (ENV_WRITE_LAYER, layout.write.display().to_string()),
            (ENV_WORK_LAYER, layout.work.display().to_string()),
            (ENV_MERGE_LAYER, layout.merge.display().to_string()),
            (ENV_CONTAINER_ID, self.container_id.clone()),
            (ENV_DETACH, (self.mode == Mode::Detached).to_string()),
        ] {
            env.push(format!("{key}={value}"));
        }
        env
    }
}

/// A started container process parked before its init phase.
pub struct Launched {
    pid: Pid,
    barrier: Option<UnixStream>,
    pty_master: Option<OwnedFd>,
}

impl Launched {
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Lets the child exec its init phase. Dropping an unreleased launch
    /// makes the child exit instead.
    pub fn release(&mut self) -> Result<()> {
        if let Some(mut barrier) = self.barrier.take() {
            barrier.write_all(&[1])?;
        }
        debug!(pid = self.pid.as_raw(), "container released");
        Ok(())
    }

    pub fn take_pty(&mut self) -> Option<OwnedFd> {
        self.pty_master.take()
    }

    /// Closes the barrier without releasing and reaps the child, which then
    /// exits before its init phase.
    pub fn abort(mut self) -> Result<i32> {
        self.barrier.take();
        self.pty_master.take();
        debug!(pid = self.pid.as_raw(), "container aborted");
        self.wait()
    }

    /// Waits for the child and returns its exit code, `128 + signal` when
    /// it was killed.
    pub fn wait(&self) -> Result<i32> {
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// File descriptors and strings the child needs, prepared before the clone
/// so the child only makes syscalls.
struct ChildSetup {
    barrier: RawFd,
    parent_barrier: RawFd,
    mode: Mode,
    stdin: Option<RawFd>,
    output: Option<RawFd>,
    pty_slave: Option<RawFd>,
    pty_master: Option<RawFd>,
    workdir: PathBuf,
    exe: CString,
    args: Vec<CString>,
    env: Vec<CString>,
}

fn child_main(setup: &ChildSetup) -> isize {
    match child_exec(setup) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "container init failed");
            1
        }
    }
}

fn child_exec(setup: &ChildSetup) -> Result<()> {
    close(setup.parent_barrier)?;
    if let Some(master) = setup.pty_master {
        close(master)?;
    }

    match setup.mode {
        Mode::Foreground => {}
        Mode::Detached => {
            setsid()?;
            if let Some(stdin) = setup.stdin {
                dup2(stdin, libc::STDIN_FILENO)?;
            }
            if let Some(output) = setup.output {
                dup2(output, libc::STDOUT_FILENO)?;
                dup2(output, libc::STDERR_FILENO)?;
            }
        }
        Mode::Interactive => {
            setsid()?;
            if let Some(slave) = setup.pty_slave {
                if unsafe { libc::ioctl(slave, libc::TIOCSCTTY, 0) } != 0 {
                    return Err(io::Error::last_os_error().into());
                }
                for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
                    dup2(slave, fd)?;
                }
                if slave > libc::STDERR_FILENO {
                    close(slave)?;
                }
            }
        }
    }

    // Parked until the parent has set up cgroups and bookkeeping.
    let mut byte = [0u8; 1];
    loop {
        match read(setup.barrier, &mut byte) {
            Ok(1) => break,
            Ok(_) => return Err(Error::ExecCommand("launch aborted".to_string())),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    chdir(&setup.workdir)?;
    let Err(e) = execve(&setup.exe, &setup.args, &setup.env);
    Err(Error::ExecCommand(format!("exec init: {e}")))
}

/// Clones the container process into fresh namespaces and parks it on a
/// barrier until [`Launched::release`].
pub fn launch(spec: &LaunchSpec) -> Result<Launched> {
    if spec.command.is_empty() {
        return Err(Error::MalformedArgs("no command given".to_string()));
    }

    let (parent_end, child_end) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;

    let pty = match spec.mode {
        Mode::Interactive => Some(openpty(
            window_size(libc::STDIN_FILENO).as_ref(),
            None::<&Termios>,
        )?),
        _ => None,
    };
    let (stdin, output) = match (spec.mode, &spec.log_file) {
        (Mode::Detached, Some(log)) => {
            if let Some(dir) = log.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let output = OpenOptions::new().create(true).append(true).open(log)?;
            (Some(File::open("/dev/null")?), Some(output))
        }
        _ => (None, None),
    };

    let setup = ChildSetup {
        barrier: child_end.as_raw_fd(),
        parent_barrier: parent_end.as_raw_fd(),
        mode: spec.mode,
        stdin: stdin.as_ref().map(AsRawFd::as_raw_fd),
        output: output.as_ref().map(AsRawFd::as_raw_fd),
        pty_slave: pty.as_ref().map(|p| p.slave.as_raw_fd()),
        pty_master: pty.as_ref().map(|p| p.master.as_raw_fd()),
        workdir: spec.layout.merge.clone(),
        exe: cstring(SELF_EXE)?,
        args: spec
            .init_args()
            .iter()
            .map(|a| cstring(a))
            .collect::<Result<_>>()?,
        env: spec
            .environment()
            .iter()
            .map(|e| cstring(e))
            .collect::<Result<_>>()?,
    };

    let mut stack = vec![0u8; STACK_SIZE];
    let pid = unsafe {
        clone(
            Box::new(|| child_main(&setup)),
            &mut stack,
            container_clone_flags(),
            Some(Signal::SIGCHLD as i32),
        )?
    };
    info!(pid = pid.as_raw(), id = %spec.container_id, mode = ?spec.mode, "container cloned");

    drop(child_end);
    Ok(Launched {
        pid,
        barrier: Some(UnixStream::from(parent_end)),
        pty_master: pty.map(|p| p.master),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn spec(mode: Mode, env: Vec<String>) -> LaunchSpec {
        let root = Path::new("/r");
        LaunchSpec {
            container_id: "0123456789abcdef".to_string(),
            layout: RootfsLayout {
                read: root.join("read"),
                write: root.join("write"),
                work: root.join("work"),
                merge: root.join("merge"),
            },
            command: vec!["/bin/ls".to_string(), "-la".to_string(), "/tmp".to_string()],
            env,
            mode,
            log_file: None,
        }
    }

    #[test]
    fn test_init_args_wrap_command() {
        let args = spec(Mode::Foreground, vec![]).init_args();
        assert_eq!(args.len(), 6);
        assert_eq!(args[1], "init");
        assert_eq!(args[2], "--");
        assert_eq!(args[3], "/bin/ls");
        assert_eq!(args[5], "/tmp");
    }

    #[test]
    fn test_environment_defaults_and_private_vars() {
        let env = spec(Mode::Detached, vec!["FOO=bar".to_string()]).environment();
        assert_eq!(env[0], "FOO=bar");
        assert!(env.contains(&DEFAULT_PATH.to_string()));
        assert!(env.contains(&format!("{ENV_MERGE_LAYER}=/r/merge")));
        assert!(env.contains(&format!("{ENV_DETACH}=true")));
        assert!(!env.iter().any(|e| e.starts_with("TERM=")));

        let env = spec(Mode::Interactive, vec!["PATH=/opt/bin".to_string()]).environment();
        assert_eq!(env.iter().filter(|e| e.starts_with("PATH=")).count(), 1);
        assert!(env.contains(&DEFAULT_TERM.to_string()));
    }

    #[test]
    fn test_mode_flags() {
        assert_eq!(Mode::from_flags(false, false).unwrap(), Mode::Foreground);
        assert_eq!(Mode::from_flags(true, false).unwrap(), Mode::Interactive);
        assert_eq!(Mode::from_flags(false, true).unwrap(), Mode::Detached);
        assert!(matches!(
            Mode::from_flags(true, true),
            Err(Error::TerminalAndDetach)
        ));
    }

    #[test]
    fn test_abort_reaps_parked_child() {
        use std::process::{Command, Stdio};

        let (parent_end, child_end) = UnixStream::pair().unwrap();
        // `cat` stands in for a parked child: it exits once the barrier closes.
        let child = Command::new("cat")
            .stdin(Stdio::from(OwnedFd::from(child_end)))
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let launched = Launched {
            pid: Pid::from_raw(child.id() as i32),
            barrier: Some(parent_end),
            pty_master: None,
        };

        assert_eq!(launched.abort().unwrap(), 0);
        assert!(matches!(
            waitpid(Pid::from_raw(child.id() as i32), None),
            Err(Errno::ECHILD)
        ));
    }

    #[test]
    fn test_cstring_rejects_nul() {
        assert!(cstring("a\0b").is_err());
        assert_eq!(cstring("ls").unwrap().to_str().unwrap(), "ls");
    }
}
