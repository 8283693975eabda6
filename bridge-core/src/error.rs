//! # Error Kinds
//!
//! One `thiserror` enum per failure domain. Packet-path errors never
//! propagate out of the engine; they are logged and the frame is dropped.
//! Init-path and table errors are returned to callers.

use thiserror::Error;

/// Failures in [`crate::namespace::NamespaceBuilder`]; abort daemon start.
#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("failed to create fd-passing socket pair: {0}")]
    SocketPair(#[source] std::io::Error),
    #[error("clone(2) into new user+net namespaces failed: {0}")]
    Clone(#[source] nix::Error),
    #[error("failed to write {which}: {source}")]
    UidGidMap {
        which: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open /dev/net/tun: {0}")]
    TapOpen(#[source] std::io::Error),
    #[error("TUNSETIFF ioctl failed: {0}")]
    TapIoctl(#[source] nix::Error),
    #[error("`ip` tool invocation failed ({args}): {source}")]
    IpTool {
        args: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`ip` tool exited with non-zero status running `{args}`")]
    IpToolStatus { args: String },
    #[error("failed to transfer namespace/tap fds over the socket pair: {0}")]
    FdTransfer(#[source] std::io::Error),
    #[error("child process exited abnormally during namespace setup")]
    ChildExit,
}

/// Failures in [`crate::veth::VethProvisioner`]; reported to caller, no
/// outbound frame is synthesized.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("setns(2) into bridge namespace failed: {0}")]
    Setns(#[source] nix::Error),
    #[error("`ip` tool invocation failed ({args}): {source}")]
    IpTool {
        args: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`ip` tool exited with non-zero status running `{args}`")]
    IpToolStatus { args: String },
    #[error("netlink RTM_SETLINK failed: {0}")]
    Netlink(#[from] crate::netlink::NetlinkError),
    #[error("child process exited abnormally during veth provisioning")]
    ChildExit,
    #[error("SIOCGIFHWADDR failed for {iface}: {source}")]
    HwAddr {
        iface: String,
        #[source]
        source: nix::Error,
    },
}

/// Packet-path parse/validation failure. Always results in a silent drop
/// plus a `debug`-level diagnostic — never propagated to a caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("frame shorter than Ethernet header")]
    Truncated,
    #[error("unsupported ARP hardware/protocol field")]
    UnsupportedArp,
    #[error("IPv4 header malformed or truncated")]
    MalformedIpv4,
    #[error("ICMP payload truncated")]
    MalformedIcmp,
    #[error("UDP payload truncated")]
    MalformedUdp,
    #[error("SCTP header truncated")]
    MalformedSctp,
    #[error("open-app request name_len {len} exceeds APP_URL_MAX {max}")]
    AppNameTooLong { len: u32, max: u32 },
}

/// Source IPv4 has no ARP entry, or the entry's MAC does not match the
/// frame's source MAC.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("source address failed ARP authentication")]
pub struct AuthMismatch;

/// [`crate::tables::AddressTables`] operation errors — programmer errors,
/// must be handled explicitly by callers (container start/stop, SCTP
/// endpoint registration).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    #[error("key already present in table")]
    Duplicate,
    #[error("key not found, or entry did not match by identity")]
    NotFound,
}

/// Surfaces as a response-frame error code from [`crate::broker`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BrokerError {
    #[error("permission callback completed with a non-zero status")]
    Denied,
    #[error("persona reference missing on completion")]
    PersonaMissing,
    #[error("requested application url not found")]
    AppNotFound,
    #[error("persona failed to launch the application instance")]
    LaunchFailed,
}

impl BrokerError {
    /// Error code carried in the UDP response payload's `errno` field.
    /// Values are local to this wire protocol.
    pub fn wire_errno(self) -> u32 {
        match self {
            BrokerError::Denied => 1,      // SYSTEM_ERROR
            BrokerError::PersonaMissing => 2, // PERSONA_DOES_NOT_EXIST
            BrokerError::AppNotFound => 3, // APP_DOES_NOT_EXIST
            BrokerError::LaunchFailed => 4, // SYSTEM_ERROR (launch failure)
        }
    }
}
