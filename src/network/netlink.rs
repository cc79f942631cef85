//! Minimal rtnetlink client for the link and address operations the bridge
//! driver needs.
//!
//! A socket talks to the network namespace it was created in, so callers
//! that configure a container-side interface open a fresh handle after
//! entering the container's namespace.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use ipnetwork::Ipv4Network;

use crate::error::{Error, Result};

const NETLINK_ROUTE: i32 = 0;

const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_NEWADDR: u16 = 20;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;

const NLA_F_NESTED: u16 = 1 << 15;

const IFF_UP: u32 = 0x1;

const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_MASTER: u16 = 10;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_FD: u16 = 28;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IfInfoMsg {
    ifi_family: u8,
    _pad: u8,
    ifi_type: u16,
    ifi_index: i32,
    ifi_flags: u32,
    ifi_change: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct IfAddrMsg {
    ifa_family: u8,
    ifa_prefixlen: u8,
    ifa_flags: u8,
    ifa_scope: u8,
    ifa_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlAttr {
    nla_len: u16,
    nla_type: u16,
}

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    // SAFETY: T is a plain repr(C) struct without padding-sensitive invariants.
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// A netlink message under construction.
struct Request {
    buf: Vec<u8>,
}

impl Request {
    fn new<T: Copy>(body: &T) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        buf.extend_from_slice(as_bytes(body));
        Self { buf }
    }

    fn body<T: Copy>(&mut self, body: &T) {
        self.buf.extend_from_slice(as_bytes(body));
    }

    fn attr(&mut self, attr_type: u16, value: &[u8]) {
        let len = mem::size_of::<NlAttr>() + value.len();
        let attr = NlAttr {
            nla_len: len as u16,
            nla_type: attr_type,
        };
        self.buf.extend_from_slice(as_bytes(&attr));
        self.buf.extend_from_slice(value);
        self.buf.resize(self.buf.len() + align4(len) - len, 0);
    }

    fn attr_str(&mut self, attr_type: u16, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.attr(attr_type, &bytes);
    }

    fn attr_u32(&mut self, attr_type: u16, value: u32) {
        self.attr(attr_type, &value.to_ne_bytes());
    }

    fn begin_nested(&mut self) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&[0u8; mem::size_of::<NlAttr>()]);
        start
    }

    fn end_nested(&mut self, start: usize, attr_type: u16) {
        let attr = NlAttr {
            nla_len: (self.buf.len() - start) as u16,
            nla_type: attr_type | NLA_F_NESTED,
        };
        self.buf[start..start + mem::size_of::<NlAttr>()].copy_from_slice(as_bytes(&attr));
    }

    fn finish(mut self, msg_type: u16, flags: u16, seq: u32) -> Vec<u8> {
        let hdr = NlMsgHdr {
            nlmsg_len: self.buf.len() as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: seq,
            nlmsg_pid: 0,
        };
        self.buf[..mem::size_of::<NlMsgHdr>()].copy_from_slice(as_bytes(&hdr));
        self.buf
    }
}

pub struct NetlinkHandle {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkHandle {
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(Error::Netlink(format!(
                "failed to create netlink socket: {}",
                io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = 0;
        addr.nl_groups = 0;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if ret < 0 {
            return Err(Error::Netlink(format!(
                "failed to bind netlink socket: {}",
                io::Error::last_os_error()
            )));
        }

        Ok(Self { fd, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send_and_ack(&mut self, msg: &[u8]) -> Result<()> {
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(Error::Netlink(format!(
                "failed to send netlink message: {}",
                io::Error::last_os_error()
            )));
        }

        let mut buf = [0u8; 4096];
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if len < 0 {
            return Err(Error::Netlink(format!(
                "failed to receive netlink response: {}",
                io::Error::last_os_error()
            )));
        }

        let hdr_len = mem::size_of::<NlMsgHdr>();
        if len as usize >= hdr_len + 4 {
            let hdr = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const NlMsgHdr) };
            if hdr.nlmsg_type == libc::NLMSG_ERROR as u16 {
                let code = i32::from_ne_bytes([
                    buf[hdr_len],
                    buf[hdr_len + 1],
                    buf[hdr_len + 2],
                    buf[hdr_len + 3],
                ]);
                if code != 0 {
                    let err = io::Error::from_raw_os_error(-code);
                    return Err(match -code {
                        libc::EEXIST => Error::ResourceExists(err.to_string()),
                        _ => Error::Netlink(err.to_string()),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn create_bridge(&mut self, name: &str) -> Result<u32> {
        let seq = self.next_seq();
        let mut req = Request::new(&IfInfoMsg::default());
        req.attr_str(IFLA_IFNAME, name);
        let info = req.begin_nested();
        req.attr_str(IFLA_INFO_KIND, "bridge");
        req.end_nested(info, IFLA_LINKINFO);

        let msg = req.finish(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
        );
        self.send_and_ack(&msg)?;
        get_ifindex(name)
    }

    /// Creates a veth pair whose peer end is moved into the network
    /// namespace referred to by `peer_netns`.
    pub fn create_veth(
        &mut self,
        name: &str,
        peer: &str,
        peer_mac: [u8; 6],
        peer_netns: RawFd,
    ) -> Result<u32> {
        let seq = self.next_seq();
        let mut req = Request::new(&IfInfoMsg::default());
        req.attr_str(IFLA_IFNAME, name);

        let info = req.begin_nested();
        req.attr_str(IFLA_INFO_KIND, "veth");
        let data = req.begin_nested();
        let peer_info = req.begin_nested();
        req.body(&IfInfoMsg::default());
        req.attr_str(IFLA_IFNAME, peer);
        req.attr(IFLA_ADDRESS, &peer_mac);
        req.attr_u32(IFLA_NET_NS_FD, peer_netns as u32);
        req.end_nested(peer_info, VETH_INFO_PEER);
        req.end_nested(data, IFLA_INFO_DATA);
        req.end_nested(info, IFLA_LINKINFO);

        let msg = req.finish(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
        );
        self.send_and_ack(&msg)?;
        get_ifindex(name)
    }

    pub fn delete_link(&mut self, ifindex: u32) -> Result<()> {
        let seq = self.next_seq();
        let req = Request::new(&IfInfoMsg {
            ifi_index: ifindex as i32,
            ..IfInfoMsg::default()
        });
        let msg = req.finish(RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        self.send_and_ack(&msg)
    }

    pub fn set_link_up(&mut self, ifindex: u32) -> Result<()> {
        let seq = self.next_seq();
        let req = Request::new(&IfInfoMsg {
            ifi_index: ifindex as i32,
            ifi_flags: IFF_UP,
            ifi_change: IFF_UP,
            ..IfInfoMsg::default()
        });
        let msg = req.finish(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        self.send_and_ack(&msg)
    }

    pub fn set_link_master(&mut self, ifindex: u32, master_ifindex: u32) -> Result<()> {
        let seq = self.next_seq();
        let mut req = Request::new(&IfInfoMsg {
            ifi_index: ifindex as i32,
            ..IfInfoMsg::default()
        });
        req.attr_u32(IFLA_MASTER, master_ifindex);
        let msg = req.finish(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        self.send_and_ack(&msg)
    }

    pub fn add_address(&mut self, ifindex: u32, addr: Ipv4Network) -> Result<()> {
        let seq = self.next_seq();
        let mut req = Request::new(&IfAddrMsg {
            ifa_family: libc::AF_INET as u8,
            ifa_prefixlen: addr.prefix(),
            ifa_flags: 0,
            ifa_scope: 0,
            ifa_index: ifindex,
        });
        let octets = addr.ip().octets();
        req.attr(IFA_LOCAL, &octets);
        req.attr(IFA_ADDRESS, &octets);
        let msg = req.finish(
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
        );
        self.send_and_ack(&msg)
    }
}

/// Looks up an interface index in the calling thread's network namespace.
pub fn get_ifindex(name: &str) -> Result<u32> {
    find_ifindex(name)?.ok_or_else(|| Error::ResourceNotFound(format!("interface {name}")))
}

pub fn find_ifindex(name: &str) -> Result<Option<u32>> {
    let c_name = CString::new(name).map_err(|e| Error::Netlink(e.to_string()))?;
    let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    Ok((ifindex != 0).then_some(ifindex))
}

/// Every IPv4 address currently assigned to a host interface.
pub fn host_ipv4_addrs() -> Result<Vec<Ipv4Addr>> {
    let addrs = nix::ifaddrs::getifaddrs()?
        .filter_map(|ifa| ifa.address)
        .filter_map(|addr| addr.as_sockaddr_in().map(|sin| *SocketAddrV4::from(*sin).ip()))
        .collect();
    Ok(addrs)
}
