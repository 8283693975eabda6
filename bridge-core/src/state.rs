//! # Bridge State & Configuration
//!
//! `BridgeState` is the one piece of global-ish state in the core: it
//! owns the tap/netns/userns fds and both address tables, and hands out
//! IPv4 and veth-index allocations through atomic fetch-and-add counters.
//! Its lifetime spans daemon start to shutdown.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::addr::{Ipv4Addr4, MacAddress};
use crate::engine::PacketEngine;
use crate::tap::{DebugSink, FileDebugSink, TapIo};

/// Environment-driven configuration for [`crate::namespace::NamespaceBuilder::init`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub iproute_binary: String,
    pub debug_log_path: Option<std::path::PathBuf>,
    pub uid: u32,
    pub gid: u32,
}

impl BridgeConfig {
    pub const ENV_IPROUTE_BIN: &'static str = "APD_BRIDGE_IPROUTE_BIN";
    pub const ENV_DEBUG_LOG: &'static str = "APD_BRIDGE_DEBUG_LOG";
    pub const ENV_UID: &'static str = "APD_BRIDGE_UID";
    pub const ENV_GID: &'static str = "APD_BRIDGE_GID";

    /// Reads configuration from the process environment, falling back to
    /// the calling process's real uid/gid and `/sbin/ip` when unset.
    pub fn from_env() -> Self {
        let iproute_binary =
            std::env::var(Self::ENV_IPROUTE_BIN).unwrap_or_else(|_| "/sbin/ip".to_string());
        let debug_log_path = std::env::var(Self::ENV_DEBUG_LOG).ok().map(std::path::PathBuf::from);
        let uid = std::env::var(Self::ENV_UID)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| nix::unistd::getuid().as_raw());
        let gid = std::env::var(Self::ENV_GID)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| nix::unistd::getgid().as_raw());

        Self {
            iproute_binary,
            debug_log_path,
            uid,
            gid,
        }
    }

    pub fn open_debug_sink(&self) -> std::io::Result<Option<Box<dyn DebugSink>>> {
        match &self.debug_log_path {
            Some(path) => Ok(Some(Box::new(FileDebugSink::open(path)?))),
            None => Ok(None),
        }
    }
}

/// The bridge's first IPv4 allocation is reserved for itself.
pub const BRIDGE_IP: Ipv4Addr4 = Ipv4Addr4::new(10, 0, 0, 1);
const BRIDGE_NET_BASE: u32 = 0x0A00_0000;
const FIRST_CONTAINER_ADDR: u32 = BRIDGE_NET_BASE + 2;

pub struct BridgeState {
    pub bridge_ip: Ipv4Addr4,
    pub bridge_mac: MacAddress,
    pub net_ns_fd: RawFd,
    pub user_ns_fd: RawFd,
    pub tap: TapIo,
    pub engine: PacketEngine,
    next_ip: AtomicU32,
    next_veth_index: AtomicU32,
}

impl BridgeState {
    pub fn new(
        bridge_mac: MacAddress,
        net_ns_fd: RawFd,
        user_ns_fd: RawFd,
        tap: TapIo,
        engine: PacketEngine,
    ) -> Self {
        Self {
            bridge_ip: BRIDGE_IP,
            bridge_mac,
            net_ns_fd,
            user_ns_fd,
            tap,
            engine,
            next_ip: AtomicU32::new(FIRST_CONTAINER_ADDR),
            next_veth_index: AtomicU32::new(0),
        }
    }

    /// Allocates the next container IPv4 in `10.0.0.0/8`, strictly
    /// monotonic for the daemon's lifetime. Built from the full 32-bit
    /// counter so the address space doesn't wrap back over the bridge's
    /// own address after 254 allocations.
    pub fn allocate_ip(&self) -> Ipv4Addr4 {
        let addr = self.next_ip.fetch_add(1, Ordering::SeqCst);
        Ipv4Addr4::from(addr)
    }

    pub fn allocate_veth_index(&self) -> u32 {
        self.next_veth_index.fetch_add(1, Ordering::SeqCst)
    }
}
