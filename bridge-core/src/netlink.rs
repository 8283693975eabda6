//! # Netlink RTM_SETLINK
//!
//! A fixed struct (nlmsghdr + ifinfomsg + rtattr + ns-fd) serialized with
//! native endianness, used only to move an interface into another network
//! namespace. No generic netlink parser: the ack frame is validated by
//! checking `NLMSG_ERROR` and a zero `error` field.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

const AF_NETLINK: libc::c_int = 16;
const NETLINK_ROUTE: libc::c_int = 0;
const RTM_SETLINK: u16 = 19;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const NLMSG_ERROR: u16 = 2;
const IFLA_NET_NS_FD: u16 = 19;
const ARPHRD_ETHER: u16 = 1;

#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("failed to open AF_NETLINK/NETLINK_ROUTE socket: {0}")]
    SocketCreate(#[source] nix::Error),
    #[error("failed to send RTM_SETLINK request: {0}")]
    Send(#[source] io::Error),
    #[error("failed to receive RTM_SETLINK response: {0}")]
    Recv(#[source] io::Error),
    #[error("netlink response shorter than an nlmsghdr")]
    ShortResponse,
    #[error("kernel did not send an NLMSG_ERROR ack")]
    NotAnAck,
    #[error("kernel rejected RTM_SETLINK with errno {0}")]
    KernelRejected(i32),
}

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
#[derive(Debug, Clone, Copy)]
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
struct RtAttr {
    rta_len: u16,
    rta_type: u16,
}

#[repr(C)]
struct SetLinkNsRequest {
    hdr: NlMsgHdr,
    ifi: IfInfoMsg,
    ns_fd_attr: RtAttr,
    ns_fd: i32,
}

fn as_bytes<T>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts((value as *const T) as *const u8, std::mem::size_of::<T>()) }
}

/// Sends `RTM_SETLINK` moving `ifindex` into `target_netns_fd`, and waits
/// for the kernel's ack: one blocking `send`/`recv` pair over a fresh
/// `NETLINK_ROUTE` socket.
pub fn move_interface_to_netns(ifindex: i32, target_netns_fd: RawFd) -> Result<(), NetlinkError> {
    // SAFETY: a plain AF_NETLINK/SOCK_RAW/NETLINK_ROUTE socket(2), no
    // pointers or shared memory involved.
    let raw_fd = unsafe { libc::socket(AF_NETLINK, libc::SOCK_RAW, NETLINK_ROUTE) };
    if raw_fd < 0 {
        return Err(NetlinkError::SocketCreate(nix::Error::last()));
    }

    let request = SetLinkNsRequest {
        hdr: NlMsgHdr {
            nlmsg_len: std::mem::size_of::<SetLinkNsRequest>() as u32,
            nlmsg_type: RTM_SETLINK,
            nlmsg_flags: NLM_F_REQUEST | NLM_F_ACK,
            nlmsg_seq: 0,
            nlmsg_pid: std::process::id(),
        },
        ifi: IfInfoMsg {
            ifi_family: 0, // AF_UNSPEC
            _pad: 0,
            ifi_type: ARPHRD_ETHER,
            ifi_index: ifindex,
            ifi_flags: 0,
            ifi_change: 0xFFFF_FFFF,
        },
        ns_fd_attr: RtAttr {
            rta_len: (std::mem::size_of::<RtAttr>() + std::mem::size_of::<i32>()) as u16,
            rta_type: IFLA_NET_NS_FD,
        },
        ns_fd: target_netns_fd,
    };

    let result = (|| -> Result<(), NetlinkError> {
        let sent = nix::unistd::write(raw_fd, as_bytes(&request)).map_err(|e| NetlinkError::Send(e.into()))?;
        if sent != std::mem::size_of::<SetLinkNsRequest>() {
            return Err(NetlinkError::Send(io::Error::new(io::ErrorKind::WriteZero, "short write")));
        }

        let mut recv_buf = [0u8; 512];
        let received = nix::unistd::read(raw_fd, &mut recv_buf).map_err(|e| NetlinkError::Recv(e.into()))?;
        parse_ack(&recv_buf[..received])
    })();

    let _ = nix::unistd::close(raw_fd);
    result
}

fn parse_ack(data: &[u8]) -> Result<(), NetlinkError> {
    let hdr_size = std::mem::size_of::<NlMsgHdr>();
    if data.len() < hdr_size {
        return Err(NetlinkError::ShortResponse);
    }
    let nlmsg_type = u16::from_ne_bytes([data[4], data[5]]);
    if nlmsg_type != NLMSG_ERROR {
        return Err(NetlinkError::NotAnAck);
    }
    if data.len() < hdr_size + 4 {
        return Err(NetlinkError::ShortResponse);
    }
    let error = i32::from_ne_bytes([
        data[hdr_size],
        data[hdr_size + 1],
        data[hdr_size + 2],
        data[hdr_size + 3],
    ]);
    if error != 0 {
        return Err(NetlinkError::KernelRejected(error));
    }
    Ok(())
}
