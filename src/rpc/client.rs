use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::codec::{decode, encode, read_frame_blocking, write_frame_blocking};
use super::{Action, Request, Response};
use crate::entity::{
    CommitRequest, ConnectRequest, Container, LogsRequest, NetworkRequest, PsRequest, StopRequest,
    WaitRequest,
};
use crate::error::{Error, Result};
use crate::network::{Endpoint, Network};

/// Blocking client, one connection per call.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket: PathBuf,
}

impl DaemonClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn call<P: Serialize, R: DeserializeOwned>(&self, action: Action, params: &P) -> Result<R> {
        let mut stream = UnixStream::connect(&self.socket).map_err(|e| {
            Error::IllegalServerStatus(format!(
                "daemon unreachable at {}: {e}",
                self.socket.display()
            ))
        })?;
        let request = Request::new(action, params)?;
        write_frame_blocking(&mut stream, &encode(&request)?)?;

        let frame = read_frame_blocking(&mut stream)?;
        let response: Response =
            decode(&frame).map_err(|e| Error::MalformedResponse(e.to_string()))?;
        debug!(%action, code = response.code, "response");
        response.into_result()
    }

    pub fn run(&self, container: &Container) -> Result<()> {
        self.call(Action::Run, container)
    }

    pub fn stop(&self, id: &str, exit_at: Option<i64>) -> Result<()> {
        self.call(
            Action::Stop,
            &StopRequest {
                id: id.to_string(),
                exit_at,
            },
        )
    }

    pub fn ps(&self, all: bool) -> Result<Vec<Container>> {
        self.call(Action::Ps, &PsRequest { all })
    }

    pub fn logs(&self, id: &str) -> Result<String> {
        self.call(Action::Logs, &LogsRequest { id: id.to_string() })
    }

    pub fn commit(&self, container_id: &str, dst: &str) -> Result<()> {
        self.call(
            Action::Commit,
            &CommitRequest {
                container_id: container_id.to_string(),
                dst: dst.to_string(),
            },
        )
    }

    pub fn wait(&self, request: &WaitRequest) -> Result<()> {
        self.call(Action::Wait, request)
    }

    pub fn network_create(&self, name: &str) -> Result<Network> {
        self.call(Action::NetworkCreate, &network(name))
    }

    pub fn network_rm(&self, name: &str) -> Result<Network> {
        self.call(Action::NetworkRm, &network(name))
    }

    pub fn network_inspect(&self, name: &str) -> Result<Network> {
        self.call(Action::NetworkInspect, &network(name))
    }

    pub fn network_list(&self) -> Result<Vec<Network>> {
        self.call(Action::NetworkList, &())
    }

    pub fn network_connect(&self, network: &str, container_id: &str, pid: i32) -> Result<Endpoint> {
        self.call(
            Action::NetworkConnect,
            &ConnectRequest {
                network: network.to_string(),
                container_id: container_id.to_string(),
                pid,
            },
        )
    }
}

fn network(name: &str) -> NetworkRequest {
    NetworkRequest {
        name: name.to_string(),
    }
}
