use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::bitmap::Bitmap;

/// Returns the `nth` block of `block_size` addresses counted from the base
/// network address. Blocks may run past the base prefix, which only
/// anchors the first one.
pub fn nth_subnet(base: Ipv4Network, block_size: u64, nth: u64) -> Result<Ipv4Network> {
    if block_size == 0 || !block_size.is_power_of_two() || block_size > 1 << 32 {
        return Err(Error::InvalidSize);
    }
    let prefix = 32 - block_size.trailing_zeros() as u8;
    let start = u64::from(u32::from(base.network())) + nth * block_size;
    let start = u32::try_from(start).map_err(|_| Error::OutOfRange)?;
    Ipv4Network::new(Ipv4Addr::from(start), prefix)
        .map_err(|e| Error::NetworkVersion(e.to_string()))
}

pub fn gateway_of(subnet: Ipv4Network) -> Result<Ipv4Addr> {
    nth_ip(subnet, 1)
}

pub fn nth_ip(subnet: Ipv4Network, nth: u64) -> Result<Ipv4Addr> {
    let ip = u64::from(u32::from(subnet.network())) + nth;
    let ip = u32::try_from(ip).map_err(|_| Error::OutOfRange)?;
    let ip = Ipv4Addr::from(ip);
    if !subnet.contains(ip) {
        return Err(Error::OutOfRange);
    }
    Ok(ip)
}

pub fn ip_offset(subnet: Ipv4Network, ip: Ipv4Addr) -> Result<u64> {
    if !subnet.contains(ip) {
        return Err(Error::InvalidIp(ip));
    }
    Ok(u64::from(u32::from(ip) - u32::from(subnet.network())))
}

/// Address management for one network: the subnet plus a bitmap of the
/// addresses handed out inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapIpam {
    pub subnet: Ipv4Network,
    pub subnet_index: u64,
    bitmap: Bitmap,
}

impl BitmapIpam {
    /// Takes ownership of the subnet's address map and reserves the network
    /// address, the gateway and the broadcast address.
    pub fn new(subnet: Ipv4Network, subnet_index: u64, mut bitmap: Bitmap) -> Result<Self> {
        let last = u64::from(subnet.size()).min(bitmap.size()).saturating_sub(1);
        for reserved in [0, 1, last] {
            if reserved < bitmap.size() {
                bitmap.set(reserved)?;
            }
        }
        Ok(Self {
            subnet,
            subnet_index,
            bitmap,
        })
    }

    pub fn gateway(&self) -> Result<Ipv4Addr> {
        gateway_of(self.subnet)
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn allocate_ip(&mut self) -> Result<Ipv4Addr> {
        let pos = self
            .bitmap
            .find_first_unset()
            .ok_or(Error::ResourcePoolIsEmpty)?;
        let ip = nth_ip(self.subnet, pos).map_err(|_| Error::ResourcePoolIsEmpty)?;
        self.bitmap.set(pos)?;
        Ok(ip)
    }

    pub fn release_ip(&mut self, ip: Ipv4Addr) -> Result<()> {
        let pos = ip_offset(self.subnet, ip)?;
        self.bitmap.clear(pos)
    }
}
