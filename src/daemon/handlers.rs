use std::fs;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{DaemonContext, blocking, monitor};
use crate::entity::{
    CommitRequest, ConnectRequest, Container, LogsRequest, NetworkRequest, PsRequest, StopRequest,
    WaitRequest,
};
use crate::error::{Error, Result};
use crate::network::{Endpoint, Network, NetworkType};
use crate::rootfs::{self, RootfsLayout, TarArchive};
use crate::rpc::{Action, Registry};

/// Every action the daemon serves.
pub fn registry(ctx: DaemonContext) -> Registry {
    let mut registry = Registry::new();
    route(&mut registry, &ctx, Action::Run, run);
    route(&mut registry, &ctx, Action::Stop, stop);
    route(&mut registry, &ctx, Action::Ps, ps);
    route(&mut registry, &ctx, Action::Logs, logs);
    route(&mut registry, &ctx, Action::Commit, commit);
    route(&mut registry, &ctx, Action::Wait, wait);
    route(&mut registry, &ctx, Action::NetworkCreate, network_create);
    route(&mut registry, &ctx, Action::NetworkRm, network_rm);
    route(&mut registry, &ctx, Action::NetworkInspect, network_inspect);
    route(&mut registry, &ctx, Action::NetworkList, network_list);
    route(&mut registry, &ctx, Action::NetworkConnect, network_connect);
    registry
}

fn route<P, R, H, Fut>(registry: &mut Registry, ctx: &DaemonContext, action: Action, handler: H)
where
    H: Fn(DaemonContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    let ctx = ctx.clone();
    registry.register_fn(action, move |params: P| handler(ctx.clone(), params));
}

async fn run(ctx: DaemonContext, container: Container) -> Result<()> {
    if container.id.is_empty() || container.pid <= 0 {
        return Err(Error::MalformedArgs(format!(
            "container {:?} with pid {}",
            container.id, container.pid
        )));
    }
    blocking(move || ctx.containers.insert(&container)).await
}

async fn stop(ctx: DaemonContext, request: StopRequest) -> Result<()> {
    let containers = Arc::clone(&ctx.containers);
    let key = request.id.clone();
    let container = blocking(move || containers.resolve(&key)).await?;
    ctx.stop_container(&container.id, request.exit_at).await?;
    Ok(())
}

async fn ps(ctx: DaemonContext, request: PsRequest) -> Result<Vec<Container>> {
    blocking(move || ctx.containers.list(request.all)).await
}

async fn logs(ctx: DaemonContext, request: LogsRequest) -> Result<String> {
    blocking(move || {
        let container = ctx.containers.resolve(&request.id)?;
        match fs::read_to_string(ctx.config.container_log(&container.id)) {
            Ok(text) => Ok(text),
            // Only detached containers write a log.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    })
    .await
}

async fn commit(ctx: DaemonContext, request: CommitRequest) -> Result<()> {
    blocking(move || {
        let container = ctx.containers.resolve(&request.container_id)?;
        let layout = RootfsLayout::new(&ctx.config, &container.image, &container.id);
        rootfs::commit(&layout, &PathBuf::from(&request.dst), &TarArchive)
    })
    .await
}

async fn wait(ctx: DaemonContext, request: WaitRequest) -> Result<()> {
    let containers = Arc::clone(&ctx.containers);
    let id = request.container_id.clone();
    blocking(move || containers.get(&id)).await?;
    monitor::spawn(ctx, request);
    Ok(())
}

async fn network_create(ctx: DaemonContext, request: NetworkRequest) -> Result<Network> {
    blocking(move || ctx.networks.create_network(NetworkType::Bridge, &request.name)).await
}

async fn network_rm(ctx: DaemonContext, request: NetworkRequest) -> Result<Network> {
    blocking(move || {
        let network = ctx.networks.get_network_by_name(&request.name)?;
        ctx.networks.delete_network(&network.id)?;
        Ok(network)
    })
    .await
}

async fn network_inspect(ctx: DaemonContext, request: NetworkRequest) -> Result<Network> {
    blocking(move || ctx.networks.get_network_by_name(&request.name)).await
}

async fn network_list(ctx: DaemonContext, _: ()) -> Result<Vec<Network>> {
    blocking(move || ctx.networks.list()).await
}

async fn network_connect(ctx: DaemonContext, request: ConnectRequest) -> Result<Endpoint> {
    blocking(move || {
        let container = ctx.containers.get(&request.container_id)?;
        if !container.is_running() {
            return Err(Error::MalformedArgs(format!(
                "container {} is not running",
                container.id
            )));
        }
        ctx.networks
            .connect(&request.network, &container.id, request.pid)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::entity::ContainerStatus;
    use crate::network::driver::MockNetworkDriver;
    use crate::network::ipam::gateway_of;
    use crate::rpc::Request;
    use std::time::Duration;
    use tempfile::TempDir;

    const GONE_PID: i32 = i32::MAX;

    fn context(dir: &TempDir) -> DaemonContext {
        let mut config = Config::default().with_root(Some(dir.path().join("root")));
        config.cgroup.base_path = dir.path().join("cgroup");
        config.network.subnet_count = 4;
        config.network.subnet_size = 256;

        let mut driver = MockNetworkDriver::new();
        driver.expect_create().returning(|name, subnet| {
            Ok(Network {
                id: format!("id-{name}"),
                name: name.to_string(),
                network_type: NetworkType::Bridge,
                gateway: gateway_of(subnet)?,
                ip_net: subnet,
            })
        });
        driver.expect_connect().returning(|_, _, _| Ok(()));
        driver.expect_disconnect().returning(|_| Ok(()));
        driver.expect_delete().returning(|_| Ok(()));
        DaemonContext::open(config, Box::new(driver)).unwrap()
    }

    async fn call<P: Serialize, R: DeserializeOwned>(
        registry: &Registry,
        action: Action,
        params: &P,
    ) -> Result<R> {
        registry
            .dispatch(&Request::new(action, params).unwrap())
            .await
            .into_result()
    }

    fn container(id: &str) -> Container {
        Container::new(id.to_string(), GONE_PID, "busybox".into(), "top".into())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_ps_stop() {
        let dir = TempDir::new().unwrap();
        let registry = registry(context(&dir));

        call::<_, ()>(&registry, Action::Run, &container("c1")).await.unwrap();
        let running: Vec<Container> =
            call(&registry, Action::Ps, &PsRequest { all: false }).await.unwrap();
        assert_eq!(running.len(), 1);

        let stop_request = StopRequest {
            id: "c1".into(),
            exit_at: Some(42),
        };
        call::<_, ()>(&registry, Action::Stop, &stop_request).await.unwrap();
        call::<_, ()>(
            &registry,
            Action::Stop,
            &StopRequest {
                id: "c1".into(),
                exit_at: Some(99),
            },
        )
        .await
        .unwrap();

        let all: Vec<Container> =
            call(&registry, Action::Ps, &PsRequest { all: true }).await.unwrap();
        assert_eq!(all[0].status, ContainerStatus::Exited);
        assert_eq!(all[0].exit_at, Some(42));
        let running: Vec<Container> =
            call(&registry, Action::Ps, &PsRequest { all: false }).await.unwrap();
        assert!(running.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_logs() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let registry = registry(ctx.clone());
        call::<_, ()>(&registry, Action::Run, &container("c1")).await.unwrap();

        let empty: String = call(&registry, Action::Logs, &LogsRequest { id: "c1".into() })
            .await
            .unwrap();
        assert!(empty.is_empty());

        let log = ctx.config.container_log("c1");
        fs::create_dir_all(log.parent().unwrap()).unwrap();
        fs::write(&log, "hello\n").unwrap();
        let text: String = call(&registry, Action::Logs, &LogsRequest { id: "c1".into() })
            .await
            .unwrap();
        assert_eq!(text, "hello\n");

        let err = call::<_, String>(&registry, Action::Logs, &LogsRequest { id: "zz".into() })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_network_lifecycle_and_release_on_stop() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let registry = registry(ctx.clone());
        let br0 = NetworkRequest { name: "br0".into() };

        let created: Network = call(&registry, Action::NetworkCreate, &br0).await.unwrap();
        let inspected: Network = call(&registry, Action::NetworkInspect, &br0).await.unwrap();
        assert_eq!(created, inspected);
        let listed: Vec<Network> = call(&registry, Action::NetworkList, &()).await.unwrap();
        assert_eq!(listed.len(), 1);

        call::<_, ()>(&registry, Action::Run, &container("c1")).await.unwrap();
        let connect = ConnectRequest {
            network: "br0".into(),
            container_id: "c1".into(),
            pid: GONE_PID,
        };
        let endpoint: Endpoint = call(&registry, Action::NetworkConnect, &connect)
            .await
            .unwrap();
        assert_eq!(endpoint.network_id, created.id);

        let busy = call::<_, Network>(&registry, Action::NetworkRm, &br0)
            .await
            .unwrap_err();
        assert_eq!(busy.code(), Error::DeviceIsBusy(String::new()).code());

        call::<_, ()>(
            &registry,
            Action::Stop,
            &StopRequest {
                id: "c1".into(),
                exit_at: None,
            },
        )
        .await
        .unwrap();
        assert!(ctx.networks.endpoint("c1").unwrap_err().is_not_found());

        let removed: Network = call(&registry, Action::NetworkRm, &br0).await.unwrap();
        assert_eq!(removed.id, created.id);
        let gone = call::<_, Network>(&registry, Action::NetworkInspect, &br0)
            .await
            .unwrap_err();
        assert!(gone.is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_requires_running_container() {
        let dir = TempDir::new().unwrap();
        let registry = registry(context(&dir));
        let connect = ConnectRequest {
            network: "br0".into(),
            container_id: "ghost".into(),
            pid: 1,
        };
        let err = call::<_, Endpoint>(&registry, Action::NetworkConnect, &connect)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_monitor_marks_dead_container_exited() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.containers.insert(&container("c1")).unwrap();

        let request = WaitRequest {
            container_id: "c1".into(),
            pid: GONE_PID,
        };
        monitor::watch(ctx.clone(), request.clone(), Duration::from_millis(10)).await;
        let first = ctx.containers.get("c1").unwrap();
        assert_eq!(first.status, ContainerStatus::Exited);

        // A second observer of the same exit changes nothing.
        monitor::watch(ctx.clone(), request, Duration::from_millis(10)).await;
        assert_eq!(ctx.containers.get("c1").unwrap().exit_at, first.exit_at);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_unknown_container() {
        let dir = TempDir::new().unwrap();
        let registry = registry(context(&dir));
        let request = WaitRequest {
            container_id: "ghost".into(),
            pid: GONE_PID,
        };
        let err = call::<_, ()>(&registry, Action::Wait, &request)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
