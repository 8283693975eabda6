//! # Packet Module
//!
//! Byte-level parsing and construction for every header this crate speaks:
//! Ethernet, ARP, IPv4, ICMP, UDP, and the two bytes of SCTP header this
//! crate actually looks at (source port, for demultiplexing). Each
//! submodule follows the same shape: a `parse(&[u8]) -> Result<Self, _>` /
//! struct fields, a `write_into`/`write_with_payload` constructor, and
//! unit tests at the bottom.

pub mod arp;
pub mod ethernet;
pub mod icmp;
pub mod ip;
pub mod sctp;
pub mod udp;
