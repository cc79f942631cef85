//! Persisted container records and their state transitions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::entity::{Container, ContainerStatus, now_millis, resolve};
use crate::error::{Error, Result};
use crate::store::JsonStore;

/// One JSON file per container id, with a lock per id so that
/// check-kill-mark runs once per container however many stops race.
pub struct ContainerStore {
    records: JsonStore<Container>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ContainerStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            records: JsonStore::open(dir)?,
            locks: Mutex::new(HashMap::new()),
        })
    }

    async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn insert(&self, container: &Container) -> Result<()> {
        if self.records.contains(&container.id)? {
            return Err(Error::ResourceExists(format!("container {}", container.id)));
        }
        self.records.put(&container.id, container)?;
        info!(id = %container.id, pid = container.pid, image = %container.image, "container registered");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Container> {
        self.records.get(id)
    }

    /// Looks a container up by id, name or id prefix.
    pub fn resolve(&self, key: &str) -> Result<Container> {
        let all = self.records.list()?;
        resolve(&all, key).cloned()
    }

    /// Newest first; exited containers only with `all`.
    pub fn list(&self, all: bool) -> Result<Vec<Container>> {
        let mut containers: Vec<Container> = self
            .records
            .list()?
            .into_iter()
            .filter(|c| all || c.is_running())
            .collect();
        containers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(containers)
    }

    pub fn running(&self) -> Result<Vec<Container>> {
        self.list(false)
    }

    /// Kills the container and marks it exited. Returns whether this call
    /// made the transition; stopping an exited container changes nothing.
    pub async fn stop(&self, id: &str, exit_at: Option<i64>) -> Result<bool> {
        let _guard = self.lock(id).await;
        let mut container = self.records.get(id)?;
        if container.status == ContainerStatus::Exited {
            debug!(id, "container already exited");
            return Ok(false);
        }

        kill_container(container.pid)?;
        container.status = ContainerStatus::Exited;
        container.exit_at = Some(exit_at.unwrap_or_else(now_millis));
        self.records.put(id, &container)?;
        info!(id, pid = container.pid, "container exited");
        Ok(true)
    }
}

/// SIGKILL, where a process that is already gone counts as killed.
fn kill_container(pid: i32) -> Result<()> {
    // 0 and negative pids address process groups.
    if pid <= 0 {
        return Ok(());
    }
    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::from(e).wrap(&format!("kill {pid}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Larger than any pid_max, so kill reports ESRCH.
    const GONE_PID: i32 = i32::MAX;

    fn container(id: &str, created_at: i64) -> Container {
        let mut c = Container::new(id.to_string(), GONE_PID, "busybox".into(), "sleep 1".into());
        c.created_at = created_at;
        c
    }

    #[tokio::test]
    async fn test_second_stop_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = ContainerStore::open(dir.path()).unwrap();
        store.insert(&container("c1", 1)).unwrap();

        assert!(store.stop("c1", Some(1000)).await.unwrap());
        assert!(!store.stop("c1", Some(2000)).await.unwrap());

        let c = store.get("c1").unwrap();
        assert_eq!(c.status, ContainerStatus::Exited);
        assert_eq!(c.exit_at, Some(1000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stops_transition_once() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ContainerStore::open(dir.path()).unwrap());
        store.insert(&container("c1", 1)).unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.stop("c1", Some(i)).await.unwrap() })
            })
            .collect();
        let mut transitions = 0;
        for task in tasks {
            if task.await.unwrap() {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);
    }

    #[tokio::test]
    async fn test_stop_unknown_container() {
        let dir = TempDir::new().unwrap();
        let store = ContainerStore::open(dir.path()).unwrap();
        assert!(store.stop("nope", None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let dir = TempDir::new().unwrap();
        let store = ContainerStore::open(dir.path()).unwrap();
        store.insert(&container("old", 1)).unwrap();
        store.insert(&container("new", 2)).unwrap();
        assert!(matches!(
            store.insert(&container("new", 3)),
            Err(Error::ResourceExists(_))
        ));
        store.stop("old", None).await.unwrap();

        let running: Vec<String> = store.list(false).unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(running, vec!["new"]);
        let all: Vec<String> = store.list(true).unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(all, vec!["new", "old"]);
        assert_eq!(store.resolve("ne").unwrap().id, "new");
        assert!(store.get("old").unwrap().exit_at.is_some());
    }
}
