//! Copy-on-write root filesystems: a read-only image layer unpacked once per
//! image, and per-container write, work and merge layers joined by overlayfs.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Turns directories into archive files and back.
pub trait Archive: Send + Sync {
    fn pack(&self, dir: &Path, file: &Path) -> Result<()>;
    fn unpack(&self, file: &Path, dir: &Path) -> Result<()>;
}

/// Tar archives, gzip-compressed when the file name says so or the magic
/// bytes do.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarArchive;

impl TarArchive {
    fn is_gzip(path: &Path) -> Result<bool> {
        let mut magic = [0u8; 2];
        let mut file = File::open(path)?;
        Ok(file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b])
    }

    fn unpack_from<R: Read>(reader: R, dir: &Path) -> Result<()> {
        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.unpack(dir)?;
        Ok(())
    }
}

impl Archive for TarArchive {
    fn pack(&self, dir: &Path, file: &Path) -> Result<()> {
        let out = File::create(file)?;
        let name = file.to_string_lossy();
        if name.ends_with(".gz") || name.ends_with(".tgz") {
            let mut builder = tar::Builder::new(GzEncoder::new(out, Compression::default()));
            builder.follow_symlinks(false);
            builder.append_dir_all(".", dir)?;
            builder.into_inner()?.finish()?;
        } else {
            let mut builder = tar::Builder::new(out);
            builder.follow_symlinks(false);
            builder.append_dir_all(".", dir)?;
            builder.finish()?;
        }
        debug!(dir = %dir.display(), file = %file.display(), "packed");
        Ok(())
    }

    fn unpack(&self, file: &Path, dir: &Path) -> Result<()> {
        let reader = BufReader::new(File::open(file)?);
        if Self::is_gzip(file)? {
            Self::unpack_from(GzDecoder::new(reader), dir)?;
        } else {
            Self::unpack_from(reader, dir)?;
        }
        debug!(file = %file.display(), dir = %dir.display(), "unpacked");
        Ok(())
    }
}

/// The four directories behind one container's root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootfsLayout {
    pub read: PathBuf,
    pub write: PathBuf,
    pub work: PathBuf,
    pub merge: PathBuf,
}

impl RootfsLayout {
    pub fn new(config: &Config, image: &str, container_id: &str) -> Self {
        Self {
            read: config.read_layer(image),
            write: config.write_layer(container_id),
            work: config.work_layer(container_id),
            merge: config.merge_layer(container_id),
        }
    }

    pub fn overlay_options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.read.display(),
            self.write.display(),
            self.work.display()
        )
    }
}

/// Creates the layers and unpacks the image, but only into a read layer
/// that did not exist before.
pub fn prepare(layout: &RootfsLayout, image_archive: &Path, archive: &dyn Archive) -> Result<()> {
    for dir in [&layout.write, &layout.work, &layout.merge] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::MountRootFs(format!("create {}: {e}", dir.display())))?;
    }

    if layout.read.exists() {
        debug!(read = %layout.read.display(), "image layer already present");
        return Ok(());
    }

    fs::create_dir_all(&layout.read)?;
    if let Err(e) = archive.unpack(image_archive, &layout.read) {
        // Leave no half-filled layer behind for the next run to trust.
        if let Err(cleanup) = fs::remove_dir_all(&layout.read) {
            warn!(read = %layout.read.display(), error = %cleanup, "failed to remove image layer");
        }
        return Err(Error::MountRootFs(format!(
            "unpack {}: {e}",
            image_archive.display()
        )));
    }
    info!(image = %image_archive.display(), read = %layout.read.display(), "image unpacked");
    Ok(())
}

pub fn mount_overlay(layout: &RootfsLayout) -> Result<()> {
    let options = layout.overlay_options();
    mount(
        Some("overlay"),
        &layout.merge,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| Error::MountRootFs(format!("overlay on {}: {e}", layout.merge.display())))
}

/// Lazily detaches the merge layer. Not being mounted is fine.
pub fn unmount(merge: &Path) -> Result<()> {
    match umount2(merge, MntFlags::MNT_DETACH) {
        Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
        Err(e) => Err(Error::MountRootFs(format!(
            "unmount {}: {e}",
            merge.display()
        ))),
    }
}

/// Packs the container's merged view into `dst`. The overlay is mounted
/// for the duration and detached even when packing fails.
pub fn commit(layout: &RootfsLayout, dst: &Path, archive: &dyn Archive) -> Result<()> {
    mount_overlay(layout)?;
    let packed = archive.pack(&layout.merge, dst);
    let unmounted = unmount(&layout.merge);
    packed?;
    unmounted?;
    info!(merge = %layout.merge.display(), dst = %dst.display(), "container committed");
    Ok(())
}
