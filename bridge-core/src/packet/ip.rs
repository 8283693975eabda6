//! # IPv4 Header
//!
//! Fixed 20-byte header parse/construct plus checksum. Options are not
//! supported — nothing in this bridge ever needs to speak IP options.

use crate::addr::{internet_checksum, Ipv4Addr4};
use crate::error::PacketError;

pub const PROTOCOL_ICMP: u8 = 1;
pub const PROTOCOL_SCTP: u8 = 132;
pub const PROTOCOL_UDP: u8 = 17;

/// Minimum (and, in this crate, only) header length: 20 bytes.
pub const HEADER_SIZE: usize = 20;

/// "Don't Fragment" flag bit, as placed in the 3-bit flags field.
pub const FLAG_DF: u8 = 0b010;

#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    pub ihl: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,
    pub ttl: u8,
    pub protocol: u8,
    pub src_addr: Ipv4Addr4,
    pub dest_addr: Ipv4Addr4,
}

impl Ipv4Header {
    /// Parses the fixed-size header prefix. Does not validate the header
    /// checksum — inbound frames from the tap device are trusted; callers
    /// that care can call [`Self::verify_checksum`] with the raw bytes
    /// separately.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::MalformedIpv4);
        }
        let version_ihl = data[0];
        let version = version_ihl >> 4;
        let ihl = version_ihl & 0x0F;
        let header_len = (ihl as usize) * 4;
        if version != 4 || header_len < HEADER_SIZE || data.len() < header_len {
            return Err(PacketError::MalformedIpv4);
        }

        let total_length = u16::from_be_bytes([data[2], data[3]]);
        let identification = u16::from_be_bytes([data[4], data[5]]);
        let flags_fragment = u16::from_be_bytes([data[6], data[7]]);
        let flags = ((flags_fragment >> 13) & 0x07) as u8;
        let ttl = data[8];
        let protocol = data[9];
        let src_addr = Ipv4Addr4::from_bytes(&data[12..16]).ok_or(PacketError::MalformedIpv4)?;
        let dest_addr = Ipv4Addr4::from_bytes(&data[16..20]).ok_or(PacketError::MalformedIpv4)?;

        let payload_end = (total_length as usize).min(data.len());
        let payload = if payload_end > header_len {
            &data[header_len..payload_end]
        } else {
            &[]
        };

        Ok((
            Self {
                ihl,
                total_length,
                identification,
                flags,
                ttl,
                protocol,
                src_addr,
                dest_addr,
            },
            payload,
        ))
    }

    /// Builds a new header (IHL fixed at 5 / 20 bytes, no options) and
    /// appends it, with a freshly computed checksum, followed by
    /// `payload` to `out`.
    #[allow(clippy::too_many_arguments)]
    pub fn write_with_payload(
        out: &mut Vec<u8>,
        identification: u16,
        flags: u8,
        ttl: u8,
        protocol: u8,
        src_addr: Ipv4Addr4,
        dest_addr: Ipv4Addr4,
        payload: &[u8],
    ) {
        let total_length = (HEADER_SIZE + payload.len()) as u16;
        let header_start = out.len();

        out.push((4 << 4) | 5); // version=4, ihl=5
        out.push(0); // DSCP/ECN
        out.extend_from_slice(&total_length.to_be_bytes());
        out.extend_from_slice(&identification.to_be_bytes());
        let flags_fragment = (flags as u16) << 13;
        out.extend_from_slice(&flags_fragment.to_be_bytes());
        out.push(ttl);
        out.push(protocol);
        out.extend_from_slice(&[0, 0]); // checksum placeholder
        out.extend_from_slice(&src_addr.octets());
        out.extend_from_slice(&dest_addr.octets());

        let checksum = internet_checksum(&out[header_start..header_start + HEADER_SIZE]);
        out[header_start + 10..header_start + 12].copy_from_slice(&checksum.to_be_bytes());

        out.extend_from_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_checksum_verifies() {
        let mut bytes = Vec::new();
        Ipv4Header::write_with_payload(
            &mut bytes,
            0xBEEF,
            FLAG_DF,
            64,
            PROTOCOL_ICMP,
            Ipv4Addr4::new(10, 0, 0, 1),
            Ipv4Addr4::new(10, 0, 0, 2),
            &[1, 2, 3, 4],
        );

        let (hdr, payload) = Ipv4Header::parse(&bytes).unwrap();
        assert_eq!(hdr.ttl, 64);
        assert_eq!(hdr.protocol, PROTOCOL_ICMP);
        assert_eq!(hdr.src_addr, Ipv4Addr4::new(10, 0, 0, 1));
        assert_eq!(payload, &[1, 2, 3, 4]);

        assert_eq!(internet_checksum(&bytes[0..HEADER_SIZE]), 0);
    }

    #[test]
    fn rejects_truncated() {
        assert!(Ipv4Header::parse(&[0x45, 0, 0]).is_err());
    }
}
