use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

const SUBTREE_CONTROL: &str = "cgroup.subtree_control";

/// File access inside one cgroup directory.
#[derive(Debug, Clone)]
pub struct CgroupFs {
    path: PathBuf,
}

impl CgroupFs {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads a control file. A file that does not exist reads as empty.
    pub fn read(&self, name: &str) -> Result<String> {
        match fs::read_to_string(self.path.join(name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(Error::CreateCgroup(format!("read {name}: {e}"))),
        }
    }

    pub fn write(&self, name: &str, data: &str) -> Result<()> {
        debug!(path = %self.path.display(), file = name, data, "cgroup write");
        fs::write(self.path.join(name), data)
            .map_err(|e| Error::CreateCgroup(format!("write {data:?} to {name}: {e}")))
    }
}

/// Enables `controllers` for the children of `node`, skipping the ones
/// already listed in its subtree control file.
pub fn enable_controllers(node: &Path, controllers: &[&str]) -> Result<()> {
    let node = CgroupFs::new(node);
    let current = node.read(SUBTREE_CONTROL)?;
    let enabled: Vec<&str> = current.split_whitespace().collect();

    let missing: Vec<String> = controllers
        .iter()
        .filter(|c| !enabled.contains(*c))
        .map(|c| format!("+{c}"))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    node.write(SUBTREE_CONTROL, &missing.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let fs = CgroupFs::new(dir.path());
        assert_eq!(fs.read("memory.max").unwrap(), "");
        fs.write("memory.max", "max").unwrap();
        assert_eq!(fs.read("memory.max").unwrap(), "max");
    }

    #[test]
    fn test_enable_only_missing_controllers() {
        let dir = TempDir::new().unwrap();
        let control = dir.path().join(SUBTREE_CONTROL);
        fs::write(&control, "cpu io\n").unwrap();

        enable_controllers(dir.path(), &["cpu", "memory"]).unwrap();
        assert_eq!(fs::read_to_string(&control).unwrap(), "+memory");

        fs::write(&control, "cpu memory\n").unwrap();
        enable_controllers(dir.path(), &["cpu", "memory"]).unwrap();
        assert_eq!(fs::read_to_string(&control).unwrap(), "cpu memory\n");
    }
}
