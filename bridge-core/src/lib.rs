//! # Bridge Core
//!
//! Implements the appliance daemon's network bridge subsystem: the
//! isolated L2/L3 domain application containers live in, the packet
//! engine speaking ARP/ICMP/SCTP/UDP over it, and the permission broker
//! that turns an `open-app` request into a running application instance.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     apd-bridged (daemon)                     │
//! │ ┌────────────────────────────────────────────────────────┐   │
//! │ │                     EventLoop (mio)                    │   │
//! │ │   tap readability ──► TapIo::read_frame                │   │
//! │ │   completion queue ──► PermissionBroker::complete       │   │
//! │ └────────────────────────────────────────────────────────┘   │
//! │          │                                    ▲               │
//! │          ▼                                    │               │
//! │ ┌────────────────────┐   ┌─────────────────────────────────┐ │
//! │ │    PacketEngine     │──►│         AddressTables           │ │
//! │ │ ARP / ICMP / SCTP /  │  │  ARP table (RwLock<HashMap>)    │ │
//! │ │ UDP:9998 dispatch    │  │  SCTP table (RwLock<HashMap>)   │ │
//! │ └────────────────────┘   └─────────────────────────────────┘ │
//! │          │                                                    │
//! │          ▼                                                    │
//! │ ┌────────────────────┐   ┌─────────────────────────────────┐ │
//! │ │ NamespaceBuilder     │  │        VethProvisioner          │ │
//! │ │ (clone + userns +     │  │  (setns + ip link + netlink     │ │
//! │ │  netns + tap + bridge)│  │   RTM_SETLINK)                  │ │
//! │ └────────────────────┘   └─────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything outside this crate — persona storage, application manifest
//! fetching, the CLI control socket — is an external collaborator
//! reached only through the narrow contracts in [`collaborators`].

pub mod addr;
pub mod broker;
pub mod collaborators;
pub mod engine;
pub mod error;
pub mod eventloop;
pub mod namespace;
pub mod netlink;
pub mod packet;
pub mod state;
pub mod tables;
pub mod tap;
pub mod veth;

pub const SERVICE_NAME: &str = "apd-bridged";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
