//! The second phase of a launch, running as pid 1 of the new namespaces.

use std::env;
use std::ffi::CString;
use std::path::PathBuf;

use nix::unistd::{execvpe, sethostname};
use tracing::{debug, error};

use crate::config::{
    ENV_CONTAINER_ID, ENV_MERGE_LAYER, ENV_PREFIX, ENV_READ_LAYER, ENV_WORK_LAYER,
    ENV_WRITE_LAYER,
};
use crate::entity::short_id;
use crate::error::{Error, Result};
use crate::pivot_root::setup_rootfs;
use crate::rootfs::RootfsLayout;
use crate::runtime::cstring;

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::MalformedArgs(format!("{name} is not set")))
}

fn layout_from_env() -> Result<RootfsLayout> {
    Ok(RootfsLayout {
        read: PathBuf::from(required(ENV_READ_LAYER)?),
        write: PathBuf::from(required(ENV_WRITE_LAYER)?),
        work: PathBuf::from(required(ENV_WORK_LAYER)?),
        merge: PathBuf::from(required(ENV_MERGE_LAYER)?),
    })
}

/// The environment the user command sees: ours minus the launcher's
/// private variables.
fn user_environment(vars: impl Iterator<Item = (String, String)>) -> Result<Vec<CString>> {
    vars.filter(|(key, _)| !key.starts_with(ENV_PREFIX))
        .map(|(key, value)| cstring(&format!("{key}={value}")))
        .collect()
}

/// Assembles the container root and replaces this process with `command`.
/// Only returns on failure.
pub fn run_init(command: &[String]) -> Result<()> {
    let (program, _) = command
        .split_first()
        .ok_or_else(|| Error::MalformedArgs("no command given".to_string()))?;
    let container_id = required(ENV_CONTAINER_ID)?;
    let layout = layout_from_env()?;

    setup_rootfs(&layout)?;
    sethostname(short_id(&container_id))
        .map_err(|e| Error::ExecCommand(format!("sethostname: {e}")))?;

    let program = cstring(program)?;
    let args = command
        .iter()
        .map(|arg| cstring(arg))
        .collect::<Result<Vec<_>>>()?;
    let envs = user_environment(env::vars())?;

    debug!(command = ?command, "exec user command");
    let Err(e) = execvpe(&program, &args, &envs);
    error!(command = ?command, error = %e, "exec failed");
    Err(Error::ExecCommand(format!("{}: {e}", command.join(" "))))
}
