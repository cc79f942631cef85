pub mod fs;
pub mod size;
pub mod subsystem;

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::CgroupSection;
use crate::entity::CgroupConfig;
use crate::error::{Error, Result};

use self::fs::{CgroupFs, enable_controllers};
use self::subsystem::{CpuMax, Item, MemoryMax, Subsystem, SubsystemKind, Value};

const CONTROLLERS: [&str; 2] = ["cpu", "memory"];

pub fn container_cgroup_path(config: &CgroupSection, container_id: &str) -> PathBuf {
    config
        .base_path
        .join(&config.service_name)
        .join(container_id)
}

/// The cgroup of one container. Setters only change memory; `sync` writes.
#[derive(Debug)]
pub struct CgroupManager {
    fs: CgroupFs,
    procs: Subsystem,
    cpu_max: Subsystem,
    memory_max: Subsystem,
}

impl CgroupManager {
    pub fn new(config: &CgroupSection, container_id: &str) -> Result<Self> {
        let service = config.base_path.join(&config.service_name);
        let path = service.join(container_id);
        std::fs::create_dir_all(&path)
            .map_err(|e| Error::CreateCgroup(format!("{}: {e}", path.display())))?;
        enable_controllers(&service, &CONTROLLERS)?;

        let fs = CgroupFs::new(path);
        let load = |kind: SubsystemKind| Subsystem::parse(kind, &fs.read(kind.file_name())?);
        let procs = load(SubsystemKind::Procs)?;
        let cpu_max = load(SubsystemKind::CpuMax)?;
        let memory_max = load(SubsystemKind::MemoryMax)?;

        Ok(Self {
            fs,
            procs,
            cpu_max,
            memory_max,
        })
    }

    pub fn path(&self) -> &Path {
        self.fs.path()
    }

    pub fn subsystem(&self, kind: SubsystemKind) -> &Subsystem {
        match kind {
            SubsystemKind::Procs => &self.procs,
            SubsystemKind::CpuMax => &self.cpu_max,
            SubsystemKind::MemoryMax => &self.memory_max,
        }
    }

    pub fn add_pid(&mut self, pid: i32) -> Result<()> {
        self.procs.set(Item::Pid(pid))
    }

    pub fn remove_pid(&mut self, pid: i32) -> Result<()> {
        self.procs.delete(Item::Pid(pid))
    }

    pub fn set_memory_max(&mut self, limit: MemoryMax) -> Result<()> {
        self.memory_max.set(Item::MemoryMax(limit))
    }

    pub fn set_cpu_max(&mut self, limit: CpuMax) -> Result<()> {
        self.cpu_max.set(Item::CpuMax(limit))
    }

    /// Applies the user's limit strings. Absent limits are left as loaded.
    pub fn apply(&mut self, limits: &CgroupConfig) -> Result<()> {
        if let Some(memory) = &limits.memory_limit {
            self.set_memory_max(MemoryMax::parse(memory)?)?;
        }
        if let Some(cpu) = &limits.cpu_shares {
            self.set_cpu_max(CpuMax::parse(cpu)?)?;
        }
        Ok(())
    }

    /// Writes cpu, memory, then procs. The kernel takes one pid per write.
    pub fn sync(&self) -> Result<()> {
        for kind in SubsystemKind::SYNC_ORDER {
            let subsystem = self.subsystem(kind);
            match subsystem.get() {
                Value::Procs(pids) => {
                    for pid in pids {
                        self.fs.write(subsystem.name(), &pid.to_string())?;
                    }
                }
                _ => self.fs.write(subsystem.name(), &subsystem.serialize())?,
            }
        }
        info!(
            path = %self.fs.path().display(),
            cpu = %self.cpu_max.serialize(),
            memory = %self.memory_max.serialize(),
            "cgroup synced"
        );
        Ok(())
    }
}

/// Removes a container's cgroup once its processes are gone.
pub fn remove_cgroup(config: &CgroupSection, container_id: &str) {
    let path = container_cgroup_path(config, container_id);
    if !path.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir(&path) {
        warn!(path = %path.display(), error = %e, "failed to remove cgroup");
    }
}
