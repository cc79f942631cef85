use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use super::codec::{decode, encode, read_frame, write_frame};
use super::{Action, Request, Response};
use crate::error::{Error, Result};

/// Serves one action.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: &Request) -> Result<Value>;
}

/// Adapts a typed async function into a [`Handler`].
struct FnHandler<F, P, R> {
    f: F,
    _types: PhantomData<fn(P) -> R>,
}

#[async_trait]
impl<F, Fut, P, R> Handler for FnHandler<F, P, R>
where
    F: Fn(P) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R>> + Send,
    P: DeserializeOwned + Send,
    R: Serialize + Send,
{
    async fn handle(&self, request: &Request) -> Result<Value> {
        let params = request.params::<P>()?;
        let result = (self.f)(params).await?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Action name to handler table.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<Action, Box<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: Action, handler: impl Handler + 'static) {
        self.handlers.insert(action, Box::new(handler));
    }

    pub fn register_fn<P, R, F, Fut>(&mut self, action: Action, f: F)
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.register(
            action,
            FnHandler {
                f,
                _types: PhantomData,
            },
        );
    }

    pub fn contains(&self, action: Action) -> bool {
        self.handlers.contains_key(&action)
    }

    /// Runs the matching handler. Failures become error responses.
    pub async fn dispatch(&self, request: &Request) -> Response {
        let result = match request.action.parse::<Action>() {
            Ok(action) => match self.handlers.get(&action) {
                Some(handler) => handler.handle(request).await,
                None => Err(Error::UnsupportedAction(request.action.clone())),
            },
            Err(e) => Err(e),
        };
        match result {
            Ok(data) => Response::ok(data),
            Err(e) => {
                warn!(action = %request.action, code = e.code(), error = %e, "request failed");
                Response::error(&e)
            }
        }
    }
}

/// True when the pid file names a live process.
pub fn daemon_running(pid_file: &Path) -> bool {
    let Ok(text) = fs::read_to_string(pid_file) else {
        return false;
    };
    match text.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM)),
        _ => false,
    }
}

/// The daemon's unix socket listener.
pub struct Server {
    socket: PathBuf,
    pid_file: PathBuf,
    registry: Arc<Registry>,
}

impl Server {
    pub fn new(socket: impl Into<PathBuf>, pid_file: impl Into<PathBuf>, registry: Registry) -> Self {
        Self {
            socket: socket.into(),
            pid_file: pid_file.into(),
            registry: Arc::new(registry),
        }
    }

    /// Binds the socket and records our pid. Must run inside a tokio runtime.
    pub fn bind(&self) -> Result<UnixListener> {
        let own_pid = std::process::id().to_string();
        if daemon_running(&self.pid_file) {
            let recorded = fs::read_to_string(&self.pid_file).unwrap_or_default();
            if recorded.trim() != own_pid {
                return Err(Error::IllegalServerStatus(format!(
                    "daemon already running with pid {}",
                    recorded.trim()
                )));
            }
        }

        for path in [&self.socket, &self.pid_file] {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(|e| Error::CreateServer(e.to_string()))?;
            }
        }
        match fs::remove_file(&self.socket) {
            Ok(()) => debug!(socket = %self.socket.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::CreateServer(e.to_string())),
        }

        let listener = UnixListener::bind(&self.socket)
            .map_err(|e| Error::CreateServer(format!("{}: {e}", self.socket.display())))?;
        fs::set_permissions(&self.socket, fs::Permissions::from_mode(0o600))?;
        fs::write(&self.pid_file, &own_pid)?;
        info!(socket = %self.socket.display(), pid = %own_pid, "daemon listening");
        Ok(listener)
    }

    /// Accepts forever, one task per connection.
    pub async fn serve(&self, listener: UnixListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &registry).await {
                            warn!(error = %e, "connection failed");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, registry: &Registry) -> Result<()> {
    let frame = read_frame(&mut stream).await?;
    let response = match decode::<Request>(&frame) {
        Ok(request) => {
            debug!(action = %request.action, "request");
            registry.dispatch(&request).await
        }
        Err(e) => Response::error(&Error::MalformedRequest(e.to_string())),
    };
    write_frame(&mut stream, &encode(&response)?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::PsRequest;
    use crate::rpc::DaemonClient;
    use crate::rpc::codec::{read_frame_blocking, write_frame_blocking};
    use tempfile::TempDir;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_fn(Action::Ps, |params: PsRequest| async move {
            Ok::<_, Error>(vec![params.all])
        });
        registry.register_fn(Action::Stop, |_: crate::entity::StopRequest| async move {
            Err::<(), _>(Error::ResourceNotFound("container x".into()))
        });
        registry
    }

    #[tokio::test]
    async fn test_dispatch() {
        let registry = registry();
        assert!(registry.contains(Action::Ps));

        let request = Request::new(Action::Ps, &PsRequest { all: true }).unwrap();
        let rows: Vec<bool> = registry.dispatch(&request).await.into_result().unwrap();
        assert_eq!(rows, vec![true]);

        let bad = Request {
            action: "ps".into(),
            params: b"\"oops\"".to_vec(),
        };
        assert_eq!(registry.dispatch(&bad).await.code, 100_007);

        let unknown = Request {
            action: "restart".into(),
            params: b"null".to_vec(),
        };
        assert_eq!(registry.dispatch(&unknown).await.code, 100_009);

        let unregistered = Request::new(Action::Commit, &()).unwrap();
        assert_eq!(registry.dispatch(&unregistered).await.code, 100_009);
    }

    #[test]
    fn test_daemon_running_probe() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("dockerd.pid");
        assert!(!daemon_running(&pid_file));
        fs::write(&pid_file, std::process::id().to_string()).unwrap();
        assert!(daemon_running(&pid_file));
        fs::write(&pid_file, "not a pid").unwrap();
        assert!(!daemon_running(&pid_file));
        fs::write(&pid_file, "0").unwrap();
        assert!(!daemon_running(&pid_file));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serve_round_trip() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("runtime/dockerd.sock");
        let pid_file = dir.path().join("runtime/dockerd.pid");
        let server = Server::new(&socket, &pid_file, registry());
        let listener = server.bind().unwrap();
        assert_eq!(
            fs::metadata(&socket).unwrap().permissions().mode() & 0o777,
            0o600
        );
        tokio::spawn(async move { server.serve(listener).await });

        let client_socket = socket.clone();
        let (rows, stop_err, malformed) = tokio::task::spawn_blocking(move || {
            let client = DaemonClient::new(&client_socket);
            let rows: Vec<bool> = client.call(Action::Ps, &PsRequest { all: false }).unwrap();
            let stop_err = client.stop("x", None).unwrap_err();

            let mut raw = std::os::unix::net::UnixStream::connect(&client_socket).unwrap();
            write_frame_blocking(&mut raw, b"not json").unwrap();
            let malformed: Response =
                serde_json::from_slice(&read_frame_blocking(&mut raw).unwrap()).unwrap();
            (rows, stop_err, malformed)
        })
        .await
        .unwrap();

        assert_eq!(rows, vec![false]);
        assert!(stop_err.is_not_found());
        assert_eq!(malformed.code, 100_007);
        assert_eq!(
            fs::read_to_string(&pid_file).unwrap(),
            std::process::id().to_string()
        );
    }

    #[tokio::test]
    async fn test_bind_refuses_live_foreign_daemon() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("dockerd.pid");
        // pid 1 always exists.
        fs::write(&pid_file, "1").unwrap();
        let server = Server::new(dir.path().join("dockerd.sock"), &pid_file, Registry::new());
        assert!(matches!(server.bind(), Err(Error::IllegalServerStatus(_))));
    }
}
