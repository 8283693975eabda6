//! # Packet Engine
//!
//! Classifies and dispatches inbound Ethernet frames, synthesizing
//! outbound replies. Run-to-completion on a single frame:
//! nothing here blocks past taking a table's read (or, for the UDP
//! control port, write) lock, and no callback executes while a lock is
//! held.

use log::{debug, trace, warn};

use crate::addr::{self, Ipv4Addr4, MacAddress};
use crate::broker::PermissionBroker;
use crate::error::{AuthMismatch, PacketError};
use crate::eventloop::EventLoopHandle;
use crate::packet::{arp, ethernet, icmp, ip, sctp, udp};
use crate::tables::AddressTables;

pub struct PacketEngine {
    pub bridge_mac: MacAddress,
    pub bridge_ip: Ipv4Addr4,
    pub tables: AddressTables,
    pub broker: PermissionBroker,
}

/// Outcome of processing one inbound frame: at most one outbound frame is
/// produced directly; SCTP demultiplex and permission-request dispatch
/// happen as side effects (callback invocation / broker hand-off).
pub enum Outcome {
    None,
    Reply(Vec<u8>),
}

impl PacketEngine {
    pub fn new(bridge_mac: MacAddress, bridge_ip: Ipv4Addr4, broker: PermissionBroker) -> Self {
        Self {
            bridge_mac,
            bridge_ip,
            tables: AddressTables::new(),
            broker,
        }
    }

    /// Processes one inbound frame read from the tap device.
    pub fn on_frame(&self, frame: &[u8], event_loop: &EventLoopHandle) -> Outcome {
        let header = match ethernet::EthernetHeader::parse(frame) {
            Ok(h) => h,
            Err(e) => {
                debug!("dropping frame: {e}");
                return Outcome::None;
            }
        };

        match header.ethertype {
            addr::ETHERTYPE_ARP => self.handle_arp(&header),
            addr::ETHERTYPE_IPV4 => self.handle_ipv4(&header, event_loop),
            addr::ETHERTYPE_IPV6 => {
                trace!("dropping IPv6 frame (not implemented in this core)");
                Outcome::None
            }
            other => {
                debug!("dropping frame with unrecognized ethertype 0x{other:04x}");
                Outcome::None
            }
        }
    }

    fn handle_arp(&self, header: &ethernet::EthernetHeader<'_>) -> Outcome {
        let packet = match arp::ArpPacket::parse(header.payload) {
            Ok(p) => p,
            Err(e) => {
                debug!("dropping malformed ARP: {e}");
                return Outcome::None;
            }
        };

        match packet.operation {
            arp::OP_REQUEST => {
                if packet.target_ip != self.bridge_ip {
                    debug!("ARP request for {} is not the bridge IP, dropping", packet.target_ip);
                    return Outcome::None;
                }
                let reply = arp::ArpPacket::reply(self.bridge_mac, self.bridge_ip, packet.sender_ip);
                let mut frame = Vec::new();
                ethernet::write_header(&mut frame, packet.sender_mac, self.bridge_mac, addr::ETHERTYPE_ARP);
                reply.write_into(&mut frame);
                Outcome::Reply(frame)
            }
            arp::OP_REPLY => {
                debug!("ARP reply from {} ignored", packet.sender_ip);
                Outcome::None
            }
            other => {
                debug!("unrecognized ARP op {other}");
                Outcome::None
            }
        }
    }

    fn handle_ipv4(&self, header: &ethernet::EthernetHeader<'_>, event_loop: &EventLoopHandle) -> Outcome {
        if header.dest_mac != self.bridge_mac {
            return Outcome::None;
        }
        let (ip_header, ip_payload) = match ip::Ipv4Header::parse(header.payload) {
            Ok(v) => v,
            Err(e) => {
                debug!("dropping malformed IPv4: {e}");
                return Outcome::None;
            }
        };
        if ip_header.dest_addr != self.bridge_ip {
            return Outcome::None;
        }

        if let Err(AuthMismatch) = self.authenticate_source(ip_header.src_addr, header.src_mac) {
            debug!("dropping IPv4 from {}: ARP auth mismatch", ip_header.src_addr);
            return Outcome::None;
        }

        match ip_header.protocol {
            ip::PROTOCOL_ICMP => self.handle_icmp(header.src_mac, &ip_header, ip_payload),
            ip::PROTOCOL_SCTP => {
                self.handle_sctp(ip_header.src_addr, ip_payload);
                Outcome::None
            }
            ip::PROTOCOL_UDP => self.handle_udp(header.src_mac, ip_header.src_addr, ip_payload, event_loop),
            other => {
                debug!("dropping IPv4 with unhandled protocol {other}");
                Outcome::None
            }
        }
    }

    fn authenticate_source(&self, src_ip: Ipv4Addr4, src_mac: MacAddress) -> Result<(), AuthMismatch> {
        match self.tables.arp.lookup(&src_ip) {
            Some(entry) if entry.mac == src_mac => Ok(()),
            _ => Err(AuthMismatch),
        }
    }

    fn handle_icmp(&self, dest_mac: MacAddress, ip_header: &ip::Ipv4Header, payload: &[u8]) -> Outcome {
        let echo = match icmp::IcmpEcho::parse(payload) {
            Ok(e) => e,
            Err(e) => {
                debug!("dropping malformed ICMP: {e}");
                return Outcome::None;
            }
        };
        if !echo.is_echo_request() {
            debug!("dropping ICMP type {} (only ECHO handled)", echo.icmp_type);
            return Outcome::None;
        }

        let mut icmp_bytes = Vec::new();
        icmp::build_echo_reply(&mut icmp_bytes, echo.identifier, echo.sequence, echo.payload);

        let mut frame = Vec::new();
        ethernet::write_header(&mut frame, dest_mac, self.bridge_mac, addr::ETHERTYPE_IPV4);
        ip::Ipv4Header::write_with_payload(
            &mut frame,
            ip_header.identification,
            ip::FLAG_DF,
            64,
            ip::PROTOCOL_ICMP,
            self.bridge_ip,
            ip_header.src_addr,
            &icmp_bytes,
        );
        Outcome::Reply(frame)
    }

    fn handle_sctp(&self, src_ip: Ipv4Addr4, payload: &[u8]) {
        let port = match sctp::source_port(payload) {
            Ok(p) => p,
            Err(e) => {
                debug!("dropping malformed SCTP: {e}");
                return;
            }
        };
        match self.tables.sctp.lookup(&(src_ip, port)) {
            Some(entry) => (entry.on_packet)(payload),
            None => debug!("no SCTP endpoint registered for {src_ip}:{port}, dropping"),
        }
    }

    fn handle_udp(
        &self,
        src_mac: MacAddress,
        src_ip: Ipv4Addr4,
        payload: &[u8],
        event_loop: &EventLoopHandle,
    ) -> Outcome {
        let header = match udp::UdpHeader::parse(payload) {
            Ok(h) => h,
            Err(e) => {
                debug!("dropping malformed UDP: {e}");
                return Outcome::None;
            }
        };
        if header.dest_port != udp::APP_CONTROL_PORT {
            trace!("ignoring UDP to port {}", header.dest_port);
            return Outcome::None;
        }

        match self.broker.handle_request(
            &self.tables,
            event_loop.clone(),
            self.bridge_mac,
            self.bridge_ip,
            src_mac,
            src_ip,
            header.src_port,
            header.payload,
        ) {
            Ok(Some((arp_entry, request))) => {
                if let Some(callback) = arp_entry.permission_callback.clone() {
                    callback(arp_entry, request);
                }
                Outcome::None
            }
            Ok(None) => Outcome::None,
            Err(PacketError::AppNameTooLong { len, max }) => {
                debug!("open-app name_len {len} exceeds {max}, dropping");
                Outcome::None
            }
            Err(e) => {
                warn!("dropping malformed open-app request: {e}");
                Outcome::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AppInstance, AppRef, PersonaRef};
    use std::sync::Arc;

    struct NoopAppState;
    impl crate::collaborators::AppState for NoopAppState {
        fn get_app_by_url(&self, _name: &[u8]) -> Option<AppRef> {
            None
        }
    }
    struct NoopPersona;
    impl crate::collaborators::Persona for NoopPersona {
        fn launch_app_instance(&self, _persona: &PersonaRef, _app: &AppRef) -> Option<AppInstance> {
            None
        }
    }

    fn test_engine() -> PacketEngine {
        PacketEngine::new(
            MacAddress::new([2, 0xAA, 0xBB, 0xCC, 0xDD, 1]),
            Ipv4Addr4::new(10, 0, 0, 1),
            PermissionBroker::new(Arc::new(NoopAppState), Arc::new(NoopPersona)),
        )
    }

    fn loopback_handle() -> EventLoopHandle {
        let (tx, _rx) = std::sync::mpsc::channel();
        let poll = mio::Poll::new().unwrap();
        let waker = Arc::new(mio::Waker::new(poll.registry(), mio::Token(1)).unwrap());
        std::mem::forget(poll);
        crate::eventloop::test_support::handle_for_tests(tx, waker)
    }

    #[test]
    fn arp_request_for_bridge_ip_yields_reply() {
        let engine = test_engine();
        let container_mac = MacAddress::new([2, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let container_ip = Ipv4Addr4::new(10, 0, 0, 2);

        let mut frame = Vec::new();
        ethernet::write_header(&mut frame, MacAddress::BROADCAST, container_mac, addr::ETHERTYPE_ARP);
        let request = arp::ArpPacket {
            operation: arp::OP_REQUEST,
            sender_mac: container_mac,
            sender_ip: container_ip,
            target_mac: MacAddress::ZERO,
            target_ip: engine.bridge_ip,
        };
        request.write_into(&mut frame);

        match engine.on_frame(&frame, &loopback_handle()) {
            Outcome::Reply(reply) => {
                let hdr = ethernet::EthernetHeader::parse(&reply).unwrap();
                assert_eq!(hdr.ethertype, addr::ETHERTYPE_ARP);
                let arp_reply = arp::ArpPacket::parse(hdr.payload).unwrap();
                assert_eq!(arp_reply.operation, arp::OP_REPLY);
                assert_eq!(arp_reply.sender_ip, engine.bridge_ip);
                assert_eq!(arp_reply.target_mac, MacAddress::BROADCAST);
                assert_eq!(arp_reply.target_ip, container_ip);
            }
            Outcome::None => panic!("expected an ARP reply"),
        }
    }

    #[test]
    fn unauthorized_ip_produces_no_outbound_frame() {
        let engine = test_engine();
        let container_mac = MacAddress::new([2, 0x11, 0x22, 0x33, 0x44, 0x55]);
        // No ARP entry registered for 10.0.0.3 at all.
        let mut frame = Vec::new();
        ethernet::write_header(&mut frame, engine.bridge_mac, container_mac, addr::ETHERTYPE_IPV4);
        let mut icmp_bytes = Vec::new();
        icmp::build_echo_reply(&mut icmp_bytes, 1, 1, b"x");
        ip::Ipv4Header::write_with_payload(
            &mut frame,
            1,
            ip::FLAG_DF,
            64,
            ip::PROTOCOL_ICMP,
            Ipv4Addr4::new(10, 0, 0, 3),
            engine.bridge_ip,
            &icmp_bytes,
        );

        match engine.on_frame(&frame, &loopback_handle()) {
            Outcome::None => {}
            Outcome::Reply(_) => panic!("unauthorized source must not get a reply"),
        }
    }

    #[test]
    fn sctp_demultiplex_invokes_registered_endpoint_once() {
        let engine = test_engine();
        let container_mac = MacAddress::new([2, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let container_ip = Ipv4Addr4::new(10, 0, 0, 2);
        engine
            .tables
            .arp
            .insert(container_ip, Arc::new(crate::tables::ArpEntry::new(container_ip, container_mac)))
            .unwrap();

        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits_clone = hits.clone();
        engine
            .tables
            .sctp
            .insert(
                (container_ip, 5000),
                Arc::new(crate::tables::SctpEntry {
                    peer_ip: container_ip,
                    peer_port: 5000,
                    on_packet: Arc::new(move |_payload| {
                        hits_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }),
                }),
            )
            .unwrap();

        let mut frame = Vec::new();
        ethernet::write_header(&mut frame, engine.bridge_mac, container_mac, addr::ETHERTYPE_IPV4);
        let sctp_payload = [0x13, 0x88, 0, 0, 0, 0];
        ip::Ipv4Header::write_with_payload(
            &mut frame,
            1,
            ip::FLAG_DF,
            64,
            132,
            container_ip,
            engine.bridge_ip,
            &sctp_payload,
        );

        let _ = engine.on_frame(&frame, &loopback_handle());
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
