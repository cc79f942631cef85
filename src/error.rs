//! Error type shared by every part of the engine.
//!
//! Each variant maps to a stable numeric code so that errors survive the
//! trip across the daemon socket: the daemon puts `code()` and the display
//! text into the response, and the client rebuilds an [`Error::Remote`].

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Result type alias used across the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Response code for a successful request.
pub const CODE_OK: u32 = 0;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed type: {0}")]
    MalformedType(String),

    #[error("procs is empty")]
    ProcsEmpty,

    #[error("pid {0} not found in procs")]
    ProcsPidNotFound(i32),

    #[error("error create cgroup: {0}")]
    CreateCgroup(String),

    #[error("malformed args: {0}")]
    MalformedArgs(String),

    #[error("mount rootfs error: {0}")]
    MountRootFs(String),

    #[error("create uds server error: {0}")]
    CreateServer(String),

    #[error("malformed uds request: {0}")]
    MalformedRequest(String),

    #[error("malformed uds response: {0}")]
    MalformedResponse(String),

    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("illegal uds server status: {0}")]
    IllegalServerStatus(String),

    #[error("interactive (-i) and detach (-d) modes are mutually exclusive")]
    TerminalAndDetach,

    #[error("invalid bitmap size")]
    InvalidSize,

    #[error("invalid bitmap position")]
    InvalidPosition,

    #[error("no free slot left")]
    OutOfRange,

    #[error("resource already exists: {0}")]
    ResourceExists(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("device is busy: {0}")]
    DeviceIsBusy(String),

    #[error("resource pool is empty")]
    ResourcePoolIsEmpty,

    #[error("gateway {0} is already assigned to a host interface")]
    InvalidGateway(Ipv4Addr),

    #[error("ip {0} is already assigned to a host interface")]
    InvalidIp(Ipv4Addr),

    #[error("only IPv4 networks are supported: {0}")]
    NetworkVersion(String),

    #[error("exec command error: {0}")]
    ExecCommand(String),

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// An error reported by the daemon, rebuilt from a response.
    #[error("code = [{code}], error = [{message}]")]
    Remote { code: u32, message: String },
}

impl Error {
    /// Stable numeric code carried in RPC responses.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::MalformedType(_) => 100_000,
            Self::ProcsEmpty => 100_001,
            Self::ProcsPidNotFound(_) => 100_002,
            Self::CreateCgroup(_) => 100_003,
            Self::MalformedArgs(_) => 100_004,
            Self::MountRootFs(_) => 100_005,
            Self::CreateServer(_) => 100_006,
            Self::MalformedRequest(_) => 100_007,
            Self::MalformedResponse(_) => 100_008,
            Self::UnsupportedAction(_) => 100_009,
            Self::IllegalServerStatus(_) => 100_010,
            Self::TerminalAndDetach => 100_011,
            Self::InvalidSize => 100_012,
            Self::InvalidPosition => 100_013,
            Self::OutOfRange => 100_014,
            Self::ResourceExists(_) => 100_015,
            Self::ResourceNotFound(_) => 100_016,
            Self::DeviceIsBusy(_) => 100_017,
            Self::ResourcePoolIsEmpty => 100_018,
            Self::InvalidGateway(_) => 100_019,
            Self::InvalidIp(_) => 100_020,
            Self::NetworkVersion(_) => 100_021,
            Self::ExecCommand(_) => 100_022,
            Self::Netlink(_) => 100_023,
            Self::Io(_) => 100_024,
            Self::Sys(_) => 100_025,
            Self::Serialization(_) => 100_026,
            Self::Remote { code, .. } => *code,
        }
    }

    /// Prefixes the error text with `context`, keeping the code.
    ///
    /// Used where an OS failure needs to say which step it came from.
    #[must_use]
    pub fn wrap(self, context: &str) -> Self {
        match self {
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), format!("{context}: {e}"))),
            other => Self::Remote {
                code: other.code(),
                message: format!("{context}: {other}"),
            },
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ResourceNotFound(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            Self::Remote { code, .. } => *code == 100_016,
            _ => false,
        }
    }

    /// True for the "gateway or address already in use" class that makes
    /// network creation move on to the next subnet.
    #[must_use]
    pub fn is_address_in_use(&self) -> bool {
        matches!(self, Self::InvalidGateway(_) | Self::InvalidIp(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
