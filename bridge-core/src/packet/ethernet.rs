//! # Ethernet Frame Handling

use crate::addr::MacAddress;
use crate::error::PacketError;

/// Fixed Ethernet header size (dest MAC + src MAC + EtherType).
pub const HEADER_SIZE: usize = 14;

/// A parsed Ethernet header, borrowing its payload from the original frame
/// buffer. The packet engine never needs to own frame bytes past the life
/// of a single `on_frame` call, so this type borrows rather than copies.
#[derive(Debug, Clone, Copy)]
pub struct EthernetHeader<'a> {
    pub dest_mac: MacAddress,
    pub src_mac: MacAddress,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

impl<'a> EthernetHeader<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::Truncated);
        }
        let dest_mac = MacAddress::from_bytes(&data[0..6]).ok_or(PacketError::Truncated)?;
        let src_mac = MacAddress::from_bytes(&data[6..12]).ok_or(PacketError::Truncated)?;
        let ethertype = u16::from_be_bytes([data[12], data[13]]);
        Ok(Self {
            dest_mac,
            src_mac,
            ethertype,
            payload: &data[HEADER_SIZE..],
        })
    }
}

/// Serializes an Ethernet header followed by `payload` into `out`. Never
/// pads to a 60-byte minimum frame: the checksum and length of the
/// synthesized packet are defined in terms of its exact length, and tap
/// devices do not require minimum-frame padding the way a physical MAC
/// does.
pub fn write_header(out: &mut Vec<u8>, dest_mac: MacAddress, src_mac: MacAddress, ethertype: u16) {
    out.extend_from_slice(dest_mac.as_bytes());
    out.extend_from_slice(src_mac.as_bytes());
    out.extend_from_slice(&ethertype.to_be_bytes());
}
