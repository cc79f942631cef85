pub mod bitmap;
pub mod driver;
pub mod ipam;
pub mod netlink;

use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::JsonStore;

use bitmap::{Bitmap, IpNetBitmap};
use driver::NetworkDriver;
use ipam::{BitmapIpam, nth_subnet};

pub use driver::BridgeDriver;

/// Linux interface names are limited to 15 bytes.
pub const MAX_IFNAME_LEN: usize = 15;
const VETH_HOST_PREFIX: &str = "veth";
const VETH_PEER_PREFIX: &str = "ceth";
const VETH_ID_LEN: usize = MAX_IFNAME_LEN - 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Bridge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub network_type: NetworkType,
    pub gateway: Ipv4Addr,
    pub ip_net: Ipv4Network,
}

/// A container's attachment to a network, keyed by container id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    /// Host end of the veth pair.
    pub name: String,
    /// Container end of the veth pair.
    pub peer: String,
    pub mac: String,
    pub ip: Ipv4Network,
    pub network_id: String,
    pub network_name: String,
}

/// Host and container veth names for a container id.
pub fn veth_names(container_id: &str) -> (String, String) {
    let id = container_id.get(..VETH_ID_LEN).unwrap_or(container_id);
    (
        format!("{VETH_HOST_PREFIX}{id}"),
        format!("{VETH_PEER_PREFIX}{id}"),
    )
}

/// Locally administered MAC derived from the address, as docker does.
pub fn mac_bytes(ip: Ipv4Addr) -> [u8; 6] {
    let [a, b, c, d] = ip.octets();
    [0x02, 0x42, a, b, c, d]
}

pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// All network state of the daemon. The subnet bitmap lock also serializes
/// every mutation of the stores.
pub struct Networks {
    bitmap: Mutex<IpNetBitmap>,
    base: Ipv4Network,
    networks: JsonStore<Network>,
    endpoints: JsonStore<Endpoint>,
    ipams: JsonStore<BitmapIpam>,
    driver: Box<dyn NetworkDriver>,
}

impl Networks {
    pub fn open(config: &Config, driver: Box<dyn NetworkDriver>) -> Result<Self> {
        let base: Ipv4Network = config
            .network
            .base_cidr
            .parse()
            .map_err(|_| Error::NetworkVersion(config.network.base_cidr.clone()))?;
        let networks = Self {
            bitmap: Mutex::new(IpNetBitmap::new(
                config.network.subnet_count,
                config.network.subnet_size,
            )?),
            base,
            networks: JsonStore::open(config.networks_dir())?,
            endpoints: JsonStore::open(config.endpoints_dir())?,
            ipams: JsonStore::open(config.ipam_dir())?,
            driver,
        };
        networks.load()?;
        Ok(networks)
    }

    fn lock(&self) -> MutexGuard<'_, IpNetBitmap> {
        self.bitmap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks every subnet recorded on disk as taken so nothing is handed
    /// out twice after a restart.
    pub fn load(&self) -> Result<()> {
        let mut bitmap = self.lock();
        for network in self.networks.list()? {
            let ipam = match self.ipams.get(&network.id) {
                Ok(ipam) => ipam,
                Err(e) => {
                    warn!(network = %network.name, error = %e, "network has no ipam record");
                    continue;
                }
            };
            if let Err(e) = bitmap.restore_subnet(ipam.subnet_index, ipam.bitmap().clone()) {
                warn!(network = %network.name, index = ipam.subnet_index, error = %e, "subnet outside pool");
            }
        }
        for endpoint in self.endpoints.list()? {
            if !self.networks.contains(&endpoint.network_id)? {
                warn!(container = %endpoint.id, network = %endpoint.network_name, "endpoint of unknown network");
            }
        }
        Ok(())
    }

    pub fn create_network(&self, network_type: NetworkType, name: &str) -> Result<Network> {
        if name.is_empty() || name.len() > MAX_IFNAME_LEN || name.contains('/') {
            return Err(Error::MalformedArgs(format!("invalid network name {name:?}")));
        }
        if self.find_by_name(name)?.is_some() {
            return Err(Error::ResourceExists(format!("network {name}")));
        }

        let mut bitmap = self.lock();
        // A concurrent create may have won the race for the name.
        if self.find_by_name(name)?.is_some() {
            return Err(Error::ResourceExists(format!("network {name}")));
        }

        loop {
            let (ip_map, index) = bitmap.allocate_subnet()?;
            let subnet = match nth_subnet(self.base, bitmap.ip_size(), index) {
                Ok(subnet) => subnet,
                Err(e) => {
                    bitmap.release_subnet(index)?;
                    return Err(e);
                }
            };

            match self.driver.create(name, subnet) {
                Ok(mut network) => {
                    network.network_type = network_type;
                    if let Err(e) = self.persist(&network, subnet, index, ip_map) {
                        self.undo_create(&mut bitmap, &network, index);
                        return Err(e);
                    }
                    info!(network = name, %subnet, "network created");
                    return Ok(network);
                }
                Err(e) if e.is_address_in_use() => {
                    // The colliding subnet stays consumed.
                    warn!(%subnet, error = %e, "subnet in use on host, trying next");
                }
                Err(e) => {
                    bitmap.release_subnet(index)?;
                    return Err(e);
                }
            }
        }
    }

    fn persist(&self, network: &Network, subnet: Ipv4Network, index: u64, ip_map: Bitmap) -> Result<()> {
        let ipam = BitmapIpam::new(subnet, index, ip_map)?;
        self.ipams.put(&network.id, &ipam)?;
        self.networks.put(&network.id, network)
    }

    /// Takes back a bridge that was created but could not be recorded.
    fn undo_create(&self, bitmap: &mut IpNetBitmap, network: &Network, index: u64) {
        if let Err(e) = self.driver.delete(network) {
            warn!(network = %network.name, error = %e, "failed to remove unrecorded bridge");
        }
        if let Err(e) = self.ipams.delete(&network.id) {
            if !e.is_not_found() {
                warn!(network = %network.name, error = %e, "failed to remove ipam record");
            }
        }
        if let Err(e) = bitmap.release_subnet(index) {
            warn!(index, error = %e, "failed to release subnet");
        }
    }

    pub fn get_network_by_name(&self, name: &str) -> Result<Network> {
        self.find_by_name(name)?
            .ok_or_else(|| Error::ResourceNotFound(format!("network {name}")))
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Network>> {
        self.networks.find(|n| n.name == name)
    }

    pub fn list(&self) -> Result<Vec<Network>> {
        self.networks.list()
    }

    pub fn endpoints_of(&self, network_id: &str) -> Result<Vec<Endpoint>> {
        Ok(self
            .endpoints
            .list()?
            .into_iter()
            .filter(|e| e.network_id == network_id)
            .collect())
    }

    pub fn endpoint(&self, container_id: &str) -> Result<Endpoint> {
        self.endpoints.get(container_id)
    }

    pub fn delete_network(&self, id: &str) -> Result<()> {
        let mut bitmap = self.lock();
        let network = self.networks.get(id)?;
        if !self.endpoints_of(id)?.is_empty() {
            return Err(Error::DeviceIsBusy(format!("network {}", network.name)));
        }

        self.driver.delete(&network)?;
        match self.ipams.get(id) {
            Ok(ipam) => {
                if let Err(e) = bitmap.release_subnet(ipam.subnet_index) {
                    warn!(network = %network.name, error = %e, "subnet was not allocated");
                }
                self.ipams.delete(id)?;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.networks.delete(id)?;
        info!(network = %network.name, "network deleted");
        Ok(())
    }

    /// Attaches the container running as `pid` to the network `network_name`.
    pub fn connect(&self, network_name: &str, container_id: &str, pid: i32) -> Result<Endpoint> {
        let _bitmap = self.lock();
        if self.endpoints.contains(container_id)? {
            return Err(Error::ResourceExists(format!("endpoint of {container_id}")));
        }
        let network = self.get_network_by_name(network_name)?;
        let mut ipam = self.ipams.get(&network.id)?;
        let ip = ipam.allocate_ip()?;

        let (name, peer) = veth_names(container_id);
        let endpoint = Endpoint {
            id: container_id.to_string(),
            name,
            peer,
            mac: format_mac(mac_bytes(ip)),
            ip: Ipv4Network::new(ip, network.ip_net.prefix())
                .map_err(|e| Error::NetworkVersion(e.to_string()))?,
            network_id: network.id.clone(),
            network_name: network.name.clone(),
        };

        self.driver.connect(&network, &endpoint, pid)?;
        self.ipams.put(&network.id, &ipam)?;
        self.endpoints.put(container_id, &endpoint)?;
        Ok(endpoint)
    }

    /// Detaches a container, returning its address to the pool.
    pub fn disconnect(&self, container_id: &str) -> Result<()> {
        let _bitmap = self.lock();
        let endpoint = self.endpoints.get(container_id)?;

        if let Err(e) = self.driver.disconnect(&endpoint) {
            warn!(container = container_id, error = %e, "failed to remove veth");
        }
        match self.ipams.get(&endpoint.network_id) {
            Ok(mut ipam) => {
                ipam.release_ip(endpoint.ip.ip())?;
                self.ipams.put(&endpoint.network_id, &ipam)?;
            }
            Err(e) => warn!(network = %endpoint.network_name, error = %e, "ipam missing"),
        }
        self.endpoints.delete(container_id)?;
        info!(container = container_id, network = %endpoint.network_name, "endpoint disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driver::MockNetworkDriver;
    use std::collections::HashSet;
    use std::fs;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn config(dir: &TempDir, subnet_count: u64, subnet_size: u64) -> Config {
        let mut config = Config::default().with_root(Some(dir.path().to_path_buf()));
        config.network.subnet_count = subnet_count;
        config.network.subnet_size = subnet_size;
        config
    }

    fn network_for(name: &str, subnet: Ipv4Network) -> Network {
        Network {
            id: format!("id-{name}"),
            name: name.to_string(),
            network_type: NetworkType::Bridge,
            gateway: ipam::gateway_of(subnet).unwrap(),
            ip_net: subnet,
        }
    }

    fn working_driver() -> MockNetworkDriver {
        let mut driver = MockNetworkDriver::new();
        driver
            .expect_create()
            .returning(|name, subnet| Ok(network_for(name, subnet)));
        driver.expect_connect().returning(|_, _, _| Ok(()));
        driver.expect_disconnect().returning(|_| Ok(()));
        driver.expect_delete().returning(|_| Ok(()));
        driver
    }

    #[test]
    fn test_veth_names_fit_interface_limit() {
        let (host, peer) = veth_names("0123456789abcdef0123456789abcdef");
        assert_eq!(host, "veth0123456789");
        assert_eq!(peer, "ceth0123456789");
        assert!(host.len() <= MAX_IFNAME_LEN);
        assert_ne!(host, peer);
    }

    #[test]
    fn test_mac_from_ip() {
        let mac = format_mac(mac_bytes(Ipv4Addr::new(172, 17, 0, 2)));
        assert_eq!(mac, "02:42:ac:11:00:02");
    }

    #[test]
    fn test_create_and_lookup() {
        let dir = TempDir::new().unwrap();
        let networks = Networks::open(&config(&dir, 4, 256), Box::new(working_driver())).unwrap();

        let created = networks.create_network(NetworkType::Bridge, "br0").unwrap();
        assert_eq!(created.ip_net.to_string(), "172.17.0.0/24");
        assert_eq!(networks.get_network_by_name("br0").unwrap(), created);
        assert_eq!(networks.list().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_name_leaves_bitmap_untouched() {
        let dir = TempDir::new().unwrap();
        let networks = Networks::open(&config(&dir, 4, 256), Box::new(working_driver())).unwrap();
        networks.create_network(NetworkType::Bridge, "br0").unwrap();
        let before = networks.lock().clone();

        let err = networks
            .create_network(NetworkType::Bridge, "br0")
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExists(_)));
        let after = networks.lock().clone();
        assert!(after.is_subnet_allocated(0));
        assert!(!after.is_subnet_allocated(1));
        assert_eq!(
            serde_json::to_value(&before).unwrap(),
            serde_json::to_value(&after).unwrap()
        );
    }

    #[test]
    fn test_collision_retries_next_subnet_and_keeps_bit() {
        let dir = TempDir::new().unwrap();
        let mut driver = MockNetworkDriver::new();
        let mut seq = mockall::Sequence::new();
        driver
            .expect_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, subnet| Err(Error::InvalidGateway(ipam::gateway_of(subnet).unwrap())));
        driver
            .expect_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, subnet| Ok(network_for(name, subnet)));
        let networks = Networks::open(&config(&dir, 4, 256), Box::new(driver)).unwrap();

        let created = networks.create_network(NetworkType::Bridge, "br0").unwrap();
        assert_eq!(created.ip_net.to_string(), "172.17.1.0/24");
        let bitmap = networks.lock();
        assert!(bitmap.is_subnet_allocated(0));
        assert!(bitmap.is_subnet_allocated(1));
    }

    #[test]
    fn test_other_driver_failure_releases_subnet() {
        let dir = TempDir::new().unwrap();
        let mut driver = MockNetworkDriver::new();
        driver
            .expect_create()
            .returning(|name, _| Err(Error::ResourceExists(format!("device {name}"))));
        let networks = Networks::open(&config(&dir, 4, 256), Box::new(driver)).unwrap();

        assert!(networks.create_network(NetworkType::Bridge, "br0").is_err());
        assert!(!networks.lock().is_subnet_allocated(0));
        assert!(networks.get_network_by_name("br0").unwrap_err().is_not_found());
    }

    #[test]
    fn test_unrecorded_network_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, 4, 256);
        let mut driver = MockNetworkDriver::new();
        driver
            .expect_create()
            .returning(|name, subnet| Ok(network_for(name, subnet)));
        driver
            .expect_delete()
            .times(1)
            .withf(|network| network.name == "br0")
            .returning(|_| Ok(()));
        let networks = Networks::open(&config, Box::new(driver)).unwrap();
        fs::remove_dir_all(config.ipam_dir()).unwrap();

        assert!(networks.create_network(NetworkType::Bridge, "br0").is_err());
        assert!(!networks.lock().is_subnet_allocated(0));
        assert!(networks.get_network_by_name("br0").unwrap_err().is_not_found());
    }

    #[test]
    fn test_pool_exhaustion() {
        let dir = TempDir::new().unwrap();
        let networks = Networks::open(&config(&dir, 2, 256), Box::new(working_driver())).unwrap();
        networks.create_network(NetworkType::Bridge, "a").unwrap();
        networks.create_network(NetworkType::Bridge, "b").unwrap();
        assert!(matches!(
            networks.create_network(NetworkType::Bridge, "c"),
            Err(Error::OutOfRange)
        ));
    }

    #[test]
    fn test_delete_busy_then_free_then_missing() {
        let dir = TempDir::new().unwrap();
        let networks = Networks::open(&config(&dir, 4, 256), Box::new(working_driver())).unwrap();
        let network = networks.create_network(NetworkType::Bridge, "br0").unwrap();

        let endpoint = networks.connect("br0", "c0ffee00c0ffee00", 4242).unwrap();
        assert_eq!(endpoint.ip.to_string(), "172.17.0.2/24");

        assert!(matches!(
            networks.delete_network(&network.id),
            Err(Error::DeviceIsBusy(_))
        ));

        networks.disconnect("c0ffee00c0ffee00").unwrap();
        networks.delete_network(&network.id).unwrap();
        assert!(networks.get_network_by_name("br0").unwrap_err().is_not_found());
        assert!(!networks.lock().is_subnet_allocated(0));
        assert!(networks.delete_network(&network.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_connect_twice_and_address_reuse() {
        let dir = TempDir::new().unwrap();
        let networks = Networks::open(&config(&dir, 4, 256), Box::new(working_driver())).unwrap();
        networks.create_network(NetworkType::Bridge, "br0").unwrap();

        let first = networks.connect("br0", "aaaa", 1).unwrap();
        assert!(matches!(
            networks.connect("br0", "aaaa", 1),
            Err(Error::ResourceExists(_))
        ));
        let second = networks.connect("br0", "bbbb", 2).unwrap();
        assert_eq!(second.ip.ip(), Ipv4Addr::new(172, 17, 0, 3));

        networks.disconnect("aaaa").unwrap();
        let third = networks.connect("br0", "cccc", 3).unwrap();
        assert_eq!(third.ip, first.ip);
        assert!(networks.disconnect("aaaa").unwrap_err().is_not_found());
    }

    #[test]
    fn test_connect_unknown_network() {
        let dir = TempDir::new().unwrap();
        let networks = Networks::open(&config(&dir, 4, 256), Box::new(working_driver())).unwrap();
        assert!(networks.connect("nope", "aaaa", 1).unwrap_err().is_not_found());
    }

    #[test]
    fn test_failed_connect_does_not_consume_address() {
        let dir = TempDir::new().unwrap();
        let mut driver = MockNetworkDriver::new();
        driver
            .expect_create()
            .returning(|name, subnet| Ok(network_for(name, subnet)));
        let mut seq = mockall::Sequence::new();
        driver
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(Error::Netlink("boom".into())));
        driver
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        let networks = Networks::open(&config(&dir, 4, 256), Box::new(driver)).unwrap();
        networks.create_network(NetworkType::Bridge, "br0").unwrap();

        assert!(networks.connect("br0", "aaaa", 1).is_err());
        let endpoint = networks.connect("br0", "aaaa", 1).unwrap();
        assert_eq!(endpoint.ip.ip(), Ipv4Addr::new(172, 17, 0, 2));
    }

    #[test]
    fn test_reload_reconciles_subnets() {
        let dir = TempDir::new().unwrap();
        {
            let networks =
                Networks::open(&config(&dir, 4, 256), Box::new(working_driver())).unwrap();
            networks.create_network(NetworkType::Bridge, "a").unwrap();
            networks.create_network(NetworkType::Bridge, "b").unwrap();
            networks.connect("a", "aaaa", 1).unwrap();
        }

        let networks = Networks::open(&config(&dir, 4, 256), Box::new(working_driver())).unwrap();
        let c = networks.create_network(NetworkType::Bridge, "c").unwrap();
        assert_eq!(c.ip_net.to_string(), "172.17.2.0/24");
        let next = networks.connect("a", "bbbb", 2).unwrap();
        assert_eq!(next.ip.ip(), Ipv4Addr::new(172, 17, 0, 3));
    }

    #[test]
    fn test_concurrent_creates_get_distinct_subnets() {
        let dir = TempDir::new().unwrap();
        let networks =
            Arc::new(Networks::open(&config(&dir, 16, 256), Box::new(working_driver())).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let networks = Arc::clone(&networks);
                thread::spawn(move || {
                    networks
                        .create_network(NetworkType::Bridge, &format!("br{i}"))
                        .unwrap()
                })
            })
            .collect();

        let subnets: HashSet<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().ip_net)
            .collect();
        assert_eq!(subnets.len(), 8);
        assert_eq!(networks.list().unwrap().len(), 8);
    }
}
