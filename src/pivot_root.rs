use std::fs;
use std::path::Path;

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::unistd::{chdir, pivot_root};
use tracing::debug;

use crate::error::{Error, Result};
use crate::rootfs::{RootfsLayout, mount_overlay};

const PUT_OLD: &str = ".pivot_root";

fn mount_err(what: &str) -> impl FnOnce(nix::Error) -> Error + '_ {
    move |e| Error::MountRootFs(format!("{what}: {e}"))
}

/// Switches the calling process, already in its own mount namespace, to the
/// container's merged overlay root.
pub fn setup_rootfs(layout: &RootfsLayout) -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(mount_err("make / private"))?;

    mount_overlay(layout)?;
    pivot_into(&layout.merge)?;
    mount_proc()?;
    mount_dev()?;
    Ok(())
}

fn pivot_into(root: &Path) -> Result<()> {
    // pivot_root needs the new root to be a mount point of its own.
    mount(
        Some(root),
        root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(mount_err("bind new root"))?;

    let put_old = root.join(PUT_OLD);
    fs::create_dir_all(&put_old)?;

    pivot_root(root, &put_old).map_err(mount_err("pivot_root"))?;
    chdir("/").map_err(mount_err("chdir /"))?;

    let put_old = Path::new("/").join(PUT_OLD);
    umount2(&put_old, MntFlags::MNT_DETACH).map_err(mount_err("detach old root"))?;
    fs::remove_dir(&put_old)?;
    debug!(root = %root.display(), "pivoted");
    Ok(())
}

fn mount_proc() -> Result<()> {
    fs::create_dir_all("/proc")?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(mount_err("mount /proc"))
}

fn mount_dev() -> Result<()> {
    fs::create_dir_all("/dev")?;
    mount(
        Some("tmpfs"),
        "/dev",
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some("mode=755"),
    )
    .map_err(mount_err("mount /dev"))
}
