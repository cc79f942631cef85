use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Prefix of the variables the launcher injects for the init phase.
pub const ENV_PREFIX: &str = "TINY_DOCKER_";
pub const ENV_READ_LAYER: &str = "TINY_DOCKER_READ";
pub const ENV_WRITE_LAYER: &str = "TINY_DOCKER_WRITE";
pub const ENV_WORK_LAYER: &str = "TINY_DOCKER_WORK";
pub const ENV_MERGE_LAYER: &str = "TINY_DOCKER_MERGE";
pub const ENV_CONTAINER_ID: &str = "TINY_DOCKER_CONTAINER_ID";
pub const ENV_DETACH: &str = "TINY_DOCKER_DETACH";

const ARCHIVE_SUFFIXES: [&str; 5] = [".tar.gz", ".tgz", ".tar.bz2", ".tar.xz", ".tar"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub meta: MetaConfig,
    pub fs: FsConfig,
    pub cgroup: CgroupSection,
    pub network: NetworkSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetaConfig {
    pub name: String,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            name: "tiny-docker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FsConfig {
    pub root: PathBuf,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/tiny-docker"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CgroupSection {
    pub base_path: PathBuf,
    pub service_name: String,
}

impl Default for CgroupSection {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/sys/fs/cgroup/system.slice"),
            service_name: "tiny-docker.service".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkSection {
    pub base_cidr: String,
    pub subnet_count: u64,
    pub subnet_size: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            base_cidr: "172.17.0.0/16".to_string(),
            subnet_count: 64,
            subnet_size: 65536,
        }
    }
}

impl Config {
    /// Loads the YAML file at `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Replaces the state root, as `--volume` does.
    #[must_use]
    pub fn with_root(mut self, root: Option<PathBuf>) -> Self {
        if let Some(root) = root {
            self.fs.root = root;
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.fs.root
    }

    pub fn read_layer(&self, image: &str) -> PathBuf {
        self.fs.root.join("images").join("read").join(image)
    }

    pub fn write_layer(&self, id: &str) -> PathBuf {
        self.fs.root.join("images").join("write").join(id)
    }

    pub fn work_layer(&self, id: &str) -> PathBuf {
        self.fs.root.join("images").join("work").join(id)
    }

    pub fn merge_layer(&self, id: &str) -> PathBuf {
        self.fs.root.join("images").join("merge").join(id)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.fs.root.join("runtime").join("dockerd.sock")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.fs.root.join("runtime").join("dockerd.pid")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.fs.root.join("logs").join("dockerd.log")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.fs.root.join("state")
    }

    pub fn container_log(&self, id: &str) -> PathBuf {
        self.fs.root.join("container").join(id).join("container.log")
    }

    pub fn networks_dir(&self) -> PathBuf {
        self.fs.root.join("network").join("networks")
    }

    pub fn endpoints_dir(&self) -> PathBuf {
        self.fs.root.join("network").join("endpoints")
    }

    pub fn ipam_dir(&self) -> PathBuf {
        self.fs.root.join("network").join("ipam")
    }
}

/// Derives an image name from an archive path: `/tmp/busybox.tar` -> `busybox`.
pub fn image_name(archive: impl AsRef<Path>) -> Result<String> {
    let archive = archive.as_ref();
    let file = archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::MalformedArgs(format!("bad image path {}", archive.display())))?;

    let name = ARCHIVE_SUFFIXES
        .iter()
        .find_map(|suffix| file.strip_suffix(suffix))
        .unwrap_or(file);

    if name.is_empty() {
        return Err(Error::MalformedArgs(format!(
            "bad image path {}",
            archive.display()
        )));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path().join("nope.yaml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.network.subnet_count, 64);
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let config = Config::from_yaml("fs:\n  root: /tmp/td\nnetwork:\n  subnet_count: 8\n").unwrap();
        assert_eq!(config.root(), Path::new("/tmp/td"));
        assert_eq!(config.network.subnet_count, 8);
        assert_eq!(config.network.subnet_size, 65536);
        assert_eq!(config.cgroup.service_name, "tiny-docker.service");
    }

    #[test]
    fn test_layout() {
        let config = Config::default().with_root(Some(PathBuf::from("/srv/td")));
        assert_eq!(
            config.read_layer("busybox"),
            PathBuf::from("/srv/td/images/read/busybox")
        );
        assert_eq!(
            config.merge_layer("abc"),
            PathBuf::from("/srv/td/images/merge/abc")
        );
        assert_eq!(
            config.container_log("abc"),
            PathBuf::from("/srv/td/container/abc/container.log")
        );
        assert_eq!(config.socket_path(), PathBuf::from("/srv/td/runtime/dockerd.sock"));
        assert_eq!(config.ipam_dir(), PathBuf::from("/srv/td/network/ipam"));
    }

    #[test]
    fn test_image_name() {
        assert_eq!(image_name("/tmp/busybox.tar").unwrap(), "busybox");
        assert_eq!(image_name("alpine.tar.gz").unwrap(), "alpine");
        assert_eq!(image_name("ubuntu.tgz").unwrap(), "ubuntu");
        assert_eq!(image_name("plain").unwrap(), "plain");
        assert!(image_name(".tar").is_err());
    }
}
