use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

pub const SHORT_ID_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Exited,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Persisted record of one container. Timestamps are unix epoch millis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub pid: i32,
    pub image: String,
    pub command: String,
    pub created_at: i64,
    #[serde(default)]
    pub exit_at: Option<i64>,
    pub status: ContainerStatus,
    #[serde(default)]
    pub name: String,
}

impl Container {
    pub fn new(id: String, pid: i32, image: String, command: String) -> Self {
        let name = short_id(&id).to_string();
        Self {
            id,
            pid,
            image,
            command,
            created_at: now_millis(),
            exit_at: None,
            status: ContainerStatus::Running,
            name,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitRequest {
    pub container_id: String,
    pub pid: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    pub id: String,
    #[serde(default)]
    pub exit_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsRequest {
    pub all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsRequest {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub container_id: String,
    /// Destination archive path.
    pub dst: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub network: String,
    pub container_id: String,
    pub pid: i32,
}

/// User-supplied limit strings such as "100m" or "0.5".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupConfig {
    pub memory_limit: Option<String>,
    pub cpu_shares: Option<String>,
}

pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Finds a container by full id, name, or unambiguous id prefix.
pub fn resolve<'a>(containers: &'a [Container], key: &str) -> Result<&'a Container> {
    if key.is_empty() {
        return Err(Error::MalformedArgs("empty container id".to_string()));
    }
    if let Some(exact) = containers.iter().find(|c| c.id == key || c.name == key) {
        return Ok(exact);
    }
    let mut matches = containers.iter().filter(|c| c.id.starts_with(key));
    match (matches.next(), matches.next()) {
        (Some(found), None) => Ok(found),
        (Some(_), Some(_)) => Err(Error::MalformedArgs(format!(
            "container id prefix {key} is ambiguous"
        ))),
        (None, _) => Err(Error::ResourceNotFound(format!("container {key}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_shape() {
        let id = new_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(short_id(&id).len(), SHORT_ID_LEN);
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let c = Container::new("0123456789abcdef".into(), 42, "busybox".into(), "sh".into());
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"status\":\"running\""));
        assert_eq!(c.name, "0123456789ab");

        let back: Container = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_resolve_by_prefix_and_name() {
        let a = Container::new("aaaa1111".into(), 1, "busybox".into(), "sh".into());
        let mut b = Container::new("aaaa2222".into(), 2, "busybox".into(), "sh".into());
        b.name = "web".into();
        let all = vec![a, b];

        assert_eq!(resolve(&all, "aaaa1").unwrap().pid, 1);
        assert_eq!(resolve(&all, "web").unwrap().pid, 2);
        assert_eq!(resolve(&all, "aaaa2222").unwrap().pid, 2);
        assert!(matches!(resolve(&all, "aaaa"), Err(Error::MalformedArgs(_))));
        assert!(resolve(&all, "ffff").unwrap_err().is_not_found());
    }
}
