//! # Veth Provisioner
//!
//! Creates a veth pair inside the bridge namespace on demand and moves one
//! end into a target container's network namespace. A forked child enters
//! the bridge namespace, creates the pair, enslaves the internal end, and
//! moves the external end via netlink; the parent reaps the child and
//! finishes addressing from outside.

use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use log::info;
use nix::sched::CloneFlags;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{ForkResult, Pid};

use crate::addr::{Ipv4Addr4, MacAddress};
use crate::error::ProvisionError;
use crate::namespace::run_ip;
use crate::netlink;
use crate::tables::ArpEntry;

pub struct VethProvisioner {
    pub net_ns_fd: RawFd,
    pub iproute_binary: String,
}

impl VethProvisioner {
    pub fn new(net_ns_fd: RawFd, iproute_binary: String) -> Self {
        Self { net_ns_fd, iproute_binary }
    }

    /// Forks a child that builds and moves the veth pair, then (in the
    /// parent, outside the target namespace — arranging namespace entry is
    /// the caller's responsibility) renames/addresses/brings up the moved
    /// end and reads its hardware address.
    pub fn create_veth_to_ns(
        &self,
        port_ix: u32,
        target_netns_fd: RawFd,
        target_ifname: &str,
        assigned_ip: Ipv4Addr4,
    ) -> Result<ArpEntry, ProvisionError> {
        let in_name = format!("in{port_ix}");
        let out_name = format!("out{port_ix}");

        // SAFETY: the forked child only calls async-signal-safe operations
        // (setns, exec via `Command`, exit) before exiting.
        match unsafe { nix::unistd::fork() } {
            Ok(ForkResult::Child) => {
                let code = self.child_create_and_move(&in_name, &out_name, target_netns_fd);
                std::process::exit(code);
            }
            Ok(ForkResult::Parent { child }) => {
                self.parent_finish(child, &out_name, target_ifname, assigned_ip)
            }
            Err(e) => Err(ProvisionError::Setns(e)),
        }
    }

    fn child_create_and_move(&self, in_name: &str, out_name: &str, target_netns_fd: RawFd) -> i32 {
        if let Err(e) = nix::sched::setns(self.net_ns_fd, CloneFlags::CLONE_NEWNET) {
            eprintln!("veth child: setns into bridge namespace failed: {e}");
            return 1;
        }
        if let Err(e) = create_veth_pair(&self.iproute_binary, in_name, out_name) {
            eprintln!("veth child: veth pair creation failed: {e}");
            return 2;
        }
        let ifindex = match interface_index(out_name) {
            Ok(i) => i,
            Err(e) => {
                eprintln!("veth child: could not look up ifindex of {out_name}: {e}");
                return 3;
            }
        };
        if let Err(e) = netlink::move_interface_to_netns(ifindex, target_netns_fd) {
            eprintln!("veth child: could not move {out_name} to target namespace: {e}");
            return 3;
        }
        0
    }

    fn parent_finish(
        &self,
        child: Pid,
        out_name: &str,
        target_ifname: &str,
        assigned_ip: Ipv4Addr4,
    ) -> Result<ArpEntry, ProvisionError> {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, 0)) => {}
            Ok(_) => return Err(ProvisionError::ChildExit),
            Err(e) => return Err(ProvisionError::Setns(e)),
        }

        run_ip(
            &self.iproute_binary,
            &["link", "set", out_name, "name", target_ifname, "multicast", "off"],
        )
        .map_err(into_provision_error)?;

        let addr_str = Ipv4Addr::from(assigned_ip).to_string();
        run_ip(
            &self.iproute_binary,
            &[
                "address",
                "add",
                &format!("{addr_str}/8"),
                "broadcast",
                "10.255.255.255",
                "dev",
                target_ifname,
            ],
        )
        .map_err(into_provision_error)?;

        run_ip(&self.iproute_binary, &["link", "set", "dev", target_ifname, "up"])
            .map_err(into_provision_error)?;

        let mac = find_hw_addr(target_ifname).map_err(|source| ProvisionError::HwAddr {
            iface: target_ifname.to_string(),
            source,
        })?;

        info!("provisioned veth: {target_ifname} -> {assigned_ip} ({mac})");
        Ok(ArpEntry::new(assigned_ip, mac))
    }
}

fn into_provision_error(e: crate::error::NamespaceError) -> ProvisionError {
    match e {
        crate::error::NamespaceError::IpTool { args, source } => ProvisionError::IpTool { args, source },
        crate::error::NamespaceError::IpToolStatus { args } => ProvisionError::IpToolStatus { args },
        _ => ProvisionError::ChildExit,
    }
}

fn create_veth_pair(iproute_binary: &str, in_name: &str, out_name: &str) -> Result<(), ProvisionError> {
    run_ip(
        iproute_binary,
        &["link", "add", in_name, "type", "veth", "peer", "name", out_name],
    )
    .map_err(into_provision_error)?;
    run_ip(iproute_binary, &["link", "set", in_name, "master", "bridge"]).map_err(into_provision_error)?;
    run_ip(iproute_binary, &["link", "set", in_name, "up"]).map_err(into_provision_error)
}

fn interface_index(if_name: &str) -> std::io::Result<i32> {
    nix::net::if_::if_nametoindex(if_name)
        .map(|i| i as i32)
        .map_err(std::io::Error::from)
}

/// `SIOCGIFHWADDR` via a throwaway `AF_UNIX` datagram socket — the
/// socket's family is irrelevant to the ioctl, only its fd.
fn find_hw_addr(if_name: &str) -> Result<MacAddress, nix::Error> {
    #[repr(C)]
    struct IfReqHwAddr {
        ifr_name: [u8; libc::IFNAMSIZ],
        sa_family: u16,
        sa_data: [u8; 14],
    }

    let sock = nix::sys::socket::socket(
        nix::sys::socket::AddressFamily::Unix,
        nix::sys::socket::SockType::Datagram,
        nix::sys::socket::SockFlag::empty(),
        None,
    )?;
    let fd = std::os::unix::io::AsRawFd::as_raw_fd(&sock);

    let mut ifr = IfReqHwAddr {
        ifr_name: [0u8; libc::IFNAMSIZ],
        sa_family: 0,
        sa_data: [0u8; 14],
    };
    let name_bytes = if_name.as_bytes();
    let len = name_bytes.len().min(libc::IFNAMSIZ - 1);
    ifr.ifr_name[..len].copy_from_slice(&name_bytes[..len]);

    const SIOCGIFHWADDR: u64 = 0x8927;
    let rc = unsafe { libc::ioctl(fd, SIOCGIFHWADDR, &mut ifr as *mut IfReqHwAddr) };
    if rc < 0 {
        return Err(nix::Error::last());
    }

    Ok(MacAddress::from_bytes(&ifr.sa_data[..6]).unwrap_or(MacAddress::ZERO))
}
