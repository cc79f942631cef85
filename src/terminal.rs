//! Interactive sessions: the caller's terminal relayed to a container pty.

use std::fs::File;
use std::io::{self, IsTerminal, Read, Write};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::thread;

use nix::pty::Winsize;
use nix::sys::termios::{self, SetArg, Termios};
use signal_hook::consts::SIGWINCH;
use signal_hook::iterator::Signals;
use tracing::{debug, warn};

use crate::error::Result;

/// Puts stdin into raw mode until dropped.
pub struct RawModeGuard {
    original: Termios,
}

impl RawModeGuard {
    /// Returns `None` when stdin is not a terminal.
    pub fn enable() -> Result<Option<Self>> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Ok(None);
        }
        let original = termios::tcgetattr(&stdin)?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;
        Ok(Some(Self { original }))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &self.original) {
            warn!(error = %e, "failed to restore terminal");
        }
    }
}

pub fn window_size(fd: RawFd) -> Option<Winsize> {
    let mut size = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut size) };
    (ret == 0).then_some(size)
}

pub fn set_window_size(fd: RawFd, size: &Winsize) {
    let ret = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, size) };
    if ret != 0 {
        debug!(error = %io::Error::last_os_error(), "failed to set window size");
    }
}

fn copy_size(from: RawFd, to: RawFd) {
    if let Some(size) = window_size(from) {
        set_window_size(to, &size);
    }
}

/// Relays stdin/stdout to the pty `master` until the container side closes.
pub fn relay(master: OwnedFd) -> Result<()> {
    let _raw = RawModeGuard::enable()?;
    let stdin_fd = io::stdin().as_raw_fd();
    let master_fd = master.as_raw_fd();
    copy_size(stdin_fd, master_fd);

    let mut signals = Signals::new([SIGWINCH])?;
    let signals_handle = signals.handle();
    let resizer = thread::spawn(move || {
        for _ in signals.forever() {
            copy_size(stdin_fd, master_fd);
        }
    });

    let mut output = File::from(master);
    let mut input = output.try_clone()?;
    // Blocks on stdin for the rest of the process; it is not joined.
    thread::spawn(move || {
        let mut stdin = io::stdin();
        if let Err(e) = io::copy(&mut stdin, &mut input) {
            debug!(error = %e, "stdin relay stopped");
        }
    });

    let result = pump(&mut output, &mut io::stdout());
    signals_handle.close();
    if resizer.join().is_err() {
        warn!("resize relay panicked");
    }
    result
}

/// Copies until EOF. A pty master reports a closed slave as EIO.
fn pump(from: &mut impl Read, to: &mut impl Write) -> Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        let n = match from.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        to.write_all(&buf[..n])?;
        to.flush()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct EioReader(bool);

    impl Read for EioReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0 {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            self.0 = true;
            buf[..2].copy_from_slice(b"ok");
            Ok(2)
        }
    }

    #[test]
    fn test_pump_copies_until_eof() {
        let mut out = Vec::new();
        pump(&mut Cursor::new(b"hello".to_vec()), &mut out).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn test_pump_treats_eio_as_eof() {
        let mut out = Vec::new();
        pump(&mut EioReader(false), &mut out).unwrap();
        assert_eq!(out, b"ok");
    }

    #[test]
    fn test_window_size_of_non_tty() {
        let file = tempfile::tempfile().unwrap();
        assert!(window_size(file.as_raw_fd()).is_none());
    }
}
