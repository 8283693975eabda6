//! # ARP (Address Resolution Protocol)
//!
//! Parses and builds the fixed 28-byte ARP payload for Ethernet/IPv4.

use crate::addr::{Ipv4Addr4, MacAddress};
use crate::error::PacketError;

const HARDWARE_ETHERNET: u16 = 1;
const PROTOCOL_IPV4: u16 = 0x0800;

pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;

/// Fixed size of an Ethernet/IPv4 ARP payload.
pub const SIZE: usize = 28;

#[derive(Debug, Clone, Copy)]
pub struct ArpPacket {
    pub operation: u16,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Addr4,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Addr4,
}

impl ArpPacket {
    /// Parses and validates hardware/protocol fields: drops (returns
    /// `Err`) if hardware type isn't Ethernet, hardware length isn't 6,
    /// protocol isn't IPv4 or its length isn't 4, or the frame is too
    /// short.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < SIZE {
            return Err(PacketError::Truncated);
        }
        let hardware_type = u16::from_be_bytes([data[0], data[1]]);
        let protocol_type = u16::from_be_bytes([data[2], data[3]]);
        let hw_len = data[4];
        let proto_len = data[5];
        let operation = u16::from_be_bytes([data[6], data[7]]);

        if hardware_type != HARDWARE_ETHERNET || hw_len != 6 {
            return Err(PacketError::UnsupportedArp);
        }
        if protocol_type == PROTOCOL_IPV4 && proto_len != 4 {
            return Err(PacketError::UnsupportedArp);
        }

        let sender_mac = MacAddress::from_bytes(&data[8..14]).ok_or(PacketError::Truncated)?;
        let sender_ip = Ipv4Addr4::from_bytes(&data[14..18]).ok_or(PacketError::Truncated)?;
        let target_mac = MacAddress::from_bytes(&data[18..24]).ok_or(PacketError::Truncated)?;
        let target_ip = Ipv4Addr4::from_bytes(&data[24..28]).ok_or(PacketError::Truncated)?;

        Ok(Self {
            operation,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    /// Builds an ARP REPLY: caller supplies the bridge's own MAC/IP as
    /// sender, the target IP copied from the request's SPA, and a
    /// broadcast target MAC.
    pub fn reply(sender_mac: MacAddress, sender_ip: Ipv4Addr4, target_ip: Ipv4Addr4) -> Self {
        Self {
            operation: OP_REPLY,
            sender_mac,
            sender_ip,
            target_mac: MacAddress::BROADCAST,
            target_ip,
        }
    }

    pub fn write_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&HARDWARE_ETHERNET.to_be_bytes());
        out.extend_from_slice(&PROTOCOL_IPV4.to_be_bytes());
        out.push(6);
        out.push(4);
        out.extend_from_slice(&self.operation.to_be_bytes());
        out.extend_from_slice(self.sender_mac.as_bytes());
        out.extend_from_slice(&self.sender_ip.octets());
        out.extend_from_slice(self.target_mac.as_bytes());
        out.extend_from_slice(&self.target_ip.octets());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_roundtrip() {
        let bridge_mac = MacAddress::new([2, 0xAA, 0xBB, 0xCC, 0xDD, 1]);
        let bridge_ip = Ipv4Addr4::new(10, 0, 0, 1);
        let requester_ip = Ipv4Addr4::new(10, 0, 0, 2);

        let reply = ArpPacket::reply(bridge_mac, bridge_ip, requester_ip);
        let mut bytes = Vec::new();
        reply.write_into(&mut bytes);

        let parsed = ArpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.operation, OP_REPLY);
        assert_eq!(parsed.sender_mac, bridge_mac);
        assert_eq!(parsed.sender_ip, bridge_ip);
        assert_eq!(parsed.target_mac, MacAddress::BROADCAST);
        assert_eq!(parsed.target_ip, requester_ip);
    }

    #[test]
    fn rejects_non_ethernet_hardware() {
        let mut bytes = vec![0u8; SIZE];
        bytes[0..2].copy_from_slice(&6u16.to_be_bytes()); // bogus hardware type
        bytes[4] = 6;
        bytes[5] = 4;
        assert!(ArpPacket::parse(&bytes).is_err());
    }
}
