//! Length-framed JSON requests between the CLI and the daemon.

pub mod client;
pub mod codec;
pub mod server;

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CODE_OK, Error, Result};

pub use client::DaemonClient;
pub use server::{Handler, Registry, Server, daemon_running};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Run,
    Stop,
    Ps,
    Logs,
    Commit,
    Wait,
    NetworkCreate,
    NetworkRm,
    NetworkInspect,
    NetworkList,
    NetworkConnect,
}

impl Action {
    pub const ALL: [Action; 11] = [
        Action::Run,
        Action::Stop,
        Action::Ps,
        Action::Logs,
        Action::Commit,
        Action::Wait,
        Action::NetworkCreate,
        Action::NetworkRm,
        Action::NetworkInspect,
        Action::NetworkList,
        Action::NetworkConnect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Stop => "stop",
            Self::Ps => "ps",
            Self::Logs => "logs",
            Self::Commit => "commit",
            Self::Wait => "wait",
            Self::NetworkCreate => "network.create",
            Self::NetworkRm => "network.rm",
            Self::NetworkInspect => "network.inspect",
            Self::NetworkList => "network.ls",
            Self::NetworkConnect => "network.connect",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| Error::UnsupportedAction(s.to_string()))
    }
}

/// `params` holds the JSON encoding of the action's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    pub params: Vec<u8>,
}

impl Request {
    pub fn new<P: Serialize>(action: Action, params: &P) -> Result<Self> {
        Ok(Self {
            action: action.as_str().to_string(),
            params: serde_json::to_vec(params)?,
        })
    }

    pub fn params<P: DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_slice(&self.params)
            .map_err(|e| Error::MalformedRequest(format!("{} params: {e}", self.action)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: u32,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Response {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            code: CODE_OK,
            message: "success".to_string(),
            data,
        }
    }

    pub fn error(error: &Error) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            data: serde_json::Value::Null,
        }
    }

    /// Decodes the payload, or rebuilds the daemon's error.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        if self.code != CODE_OK {
            return Err(Error::Remote {
                code: self.code,
                message: self.message,
            });
        }
        serde_json::from_value(self.data).map_err(|e| Error::MalformedResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::PsRequest;

    #[test]
    fn test_action_names() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert_eq!(Action::NetworkCreate.to_string(), "network.create");
        assert!(matches!(
            "restart".parse::<Action>(),
            Err(Error::UnsupportedAction(_))
        ));
    }

    #[test]
    fn test_request_params() {
        let request = Request::new(Action::Ps, &PsRequest { all: true }).unwrap();
        assert_eq!(request.action, "ps");
        assert!(request.params::<PsRequest>().unwrap().all);
        assert!(matches!(
            request.params::<Vec<String>>(),
            Err(Error::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_error_response_rebuilds_code() {
        let response = Response::error(&Error::DeviceIsBusy("network br0".into()));
        let err = response.into_result::<()>().unwrap_err();
        assert_eq!(err.code(), 100_017);
        assert!(err.to_string().contains("device is busy: network br0"));
    }

    #[test]
    fn test_ok_response_decodes_data() {
        let response = Response::ok(serde_json::json!(["a", "b"]));
        let data: Vec<String> = response.into_result().unwrap();
        assert_eq!(data, vec!["a", "b"]);
        assert_eq!(Response::ok(serde_json::Value::Null).into_result::<()>().ok(), Some(()));
    }
}
