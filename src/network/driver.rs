use std::os::unix::io::AsRawFd;

use ipnetwork::Ipv4Network;
use tracing::{debug, info, warn};

use crate::entity::new_id;
use crate::error::{Error, Result};
use crate::namespace::{open_ns, with_netns};
use crate::network::ipam::gateway_of;
use crate::network::netlink::{self, NetlinkHandle};
use crate::network::{Endpoint, Network, NetworkType, mac_bytes};

/// Host-side device management for one kind of network.
#[cfg_attr(test, mockall::automock)]
pub trait NetworkDriver: Send + Sync {
    /// Creates the device for `name` serving `subnet`.
    fn create(&self, name: &str, subnet: Ipv4Network) -> Result<Network>;

    fn delete(&self, network: &Network) -> Result<()>;

    /// Wires `endpoint` into the network namespace of `pid`.
    fn connect(&self, network: &Network, endpoint: &Endpoint, pid: i32) -> Result<()>;

    fn disconnect(&self, endpoint: &Endpoint) -> Result<()>;
}

/// Linux bridge per network, veth pair per endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeDriver;

impl BridgeDriver {
    fn check_gateway_free(gateway: std::net::Ipv4Addr) -> Result<()> {
        if netlink::host_ipv4_addrs()?.contains(&gateway) {
            return Err(Error::InvalidGateway(gateway));
        }
        Ok(())
    }
}

fn wire_endpoint(
    nl: &mut NetlinkHandle,
    network: &Network,
    endpoint: &Endpoint,
    host_index: u32,
    pid: i32,
) -> Result<()> {
    let bridge_index = netlink::get_ifindex(&network.name)?;
    nl.set_link_master(host_index, bridge_index)?;
    nl.set_link_up(host_index)?;
    nl.set_link_up(bridge_index)?;

    let peer = endpoint.peer.clone();
    let ip = endpoint.ip;
    with_netns(pid, move || {
        let mut inner = NetlinkHandle::new()?;
        let peer_index = netlink::get_ifindex(&peer)?;
        inner.set_link_up(peer_index)?;
        inner.add_address(peer_index, ip)?;
        if let Some(lo) = netlink::find_ifindex("lo")? {
            inner.set_link_up(lo)?;
        }
        Ok(())
    })
}

impl NetworkDriver for BridgeDriver {
    fn create(&self, name: &str, subnet: Ipv4Network) -> Result<Network> {
        let gateway = gateway_of(subnet)?;
        Self::check_gateway_free(gateway)?;

        if netlink::find_ifindex(name)?.is_some() {
            return Err(Error::ResourceExists(format!("device {name}")));
        }

        let mut nl = NetlinkHandle::new()?;
        let index = nl.create_bridge(name)?;
        let gateway_net = Ipv4Network::new(gateway, subnet.prefix())
            .map_err(|e| Error::NetworkVersion(e.to_string()))?;
        nl.add_address(index, gateway_net)?;
        nl.set_link_up(index)?;
        info!(bridge = name, %subnet, %gateway, "bridge created");

        Ok(Network {
            id: new_id(),
            name: name.to_string(),
            network_type: NetworkType::Bridge,
            gateway,
            ip_net: subnet,
        })
    }

    fn delete(&self, network: &Network) -> Result<()> {
        match netlink::find_ifindex(&network.name)? {
            Some(index) => {
                NetlinkHandle::new()?.delete_link(index)?;
                info!(bridge = %network.name, "bridge deleted");
            }
            None => warn!(bridge = %network.name, "bridge already gone"),
        }
        Ok(())
    }

    fn connect(&self, network: &Network, endpoint: &Endpoint, pid: i32) -> Result<()> {
        let netns = open_ns(pid, "net")?;
        let mut nl = NetlinkHandle::new()?;
        let mac = mac_bytes(endpoint.ip.ip());
        let host_index = nl.create_veth(&endpoint.name, &endpoint.peer, mac, netns.as_raw_fd())?;
        debug!(host = %endpoint.name, peer = %endpoint.peer, pid, "veth pair created");

        if let Err(e) = wire_endpoint(&mut nl, network, endpoint, host_index, pid) {
            warn!(host = %endpoint.name, error = %e, "connect failed, removing veth");
            if let Err(cleanup) = NetlinkHandle::new().and_then(|mut h| h.delete_link(host_index)) {
                warn!(host = %endpoint.name, error = %cleanup, "failed to remove veth");
            }
            return Err(e);
        }

        info!(network = %network.name, ip = %endpoint.ip, pid, "endpoint connected");
        Ok(())
    }

    fn disconnect(&self, endpoint: &Endpoint) -> Result<()> {
        // Removing the host end also removes the peer.
        if let Some(index) = netlink::find_ifindex(&endpoint.name)? {
            NetlinkHandle::new()?.delete_link(index)?;
        }
        Ok(())
    }
}
