//! End-to-end scenarios for the packet engine and permission broker,
//! exercised without any real namespace/tap/netlink machinery: a
//! [`PacketEngine`] is driven directly with synthetic frames, matching
//! the six concrete scenarios laid out for the bridge core (ARP
//! resolution, ICMP echo, unauthorized source, SCTP demultiplex, and the
//! two open-app outcomes).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bridge_core::addr::{ETHERTYPE_ARP, ETHERTYPE_IPV4, Ipv4Addr4, MacAddress};
use bridge_core::broker::{Completion, PermissionBroker, PermissionKind};
use bridge_core::collaborators::{AppInstance, AppRef, AppState, Persona, PersonaRef};
use bridge_core::engine::{Outcome, PacketEngine};
use bridge_core::eventloop::test_support::handle_for_tests;
use bridge_core::packet::{arp, ethernet, icmp, ip};
use bridge_core::tables::{ArpEntry, SctpEntry};

const BRIDGE_MAC: MacAddress = MacAddress::new([0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0x01]);
const BRIDGE_IP: Ipv4Addr4 = Ipv4Addr4::new(10, 0, 0, 1);
const CONTAINER_MAC: MacAddress = MacAddress::new([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
const CONTAINER_IP: Ipv4Addr4 = Ipv4Addr4::new(10, 0, 0, 2);

struct FixedAppState(Mutex<Option<AppRef>>);
impl AppState for FixedAppState {
    fn get_app_by_url(&self, _name: &[u8]) -> Option<AppRef> {
        self.0.lock().unwrap().clone()
    }
}

struct FixedPersona(Mutex<Option<AppInstance>>);
impl Persona for FixedPersona {
    fn launch_app_instance(&self, _persona: &PersonaRef, _app: &AppRef) -> Option<AppInstance> {
        self.0.lock().unwrap().take()
    }
}

fn test_engine(app: Option<AppRef>, instance: Option<AppInstance>) -> PacketEngine {
    PacketEngine::new(
        BRIDGE_MAC,
        BRIDGE_IP,
        PermissionBroker::new(
            Arc::new(FixedAppState(Mutex::new(app))),
            Arc::new(FixedPersona(Mutex::new(instance))),
        ),
    )
}

fn loopback_handle() -> bridge_core::eventloop::EventLoopHandle {
    let (tx, _rx) = std::sync::mpsc::channel();
    let poll = mio::Poll::new().unwrap();
    let waker = Arc::new(mio::Waker::new(poll.registry(), mio::Token(1)).unwrap());
    std::mem::forget(poll);
    handle_for_tests(tx, waker)
}

fn register_container_arp(engine: &PacketEngine) -> Arc<ArpEntry> {
    let entry = Arc::new(ArpEntry::new(CONTAINER_IP, CONTAINER_MAC));
    engine.tables.arp.insert(CONTAINER_IP, entry.clone()).unwrap();
    entry
}

#[test]
fn scenario_1_arp_resolution() {
    let engine = test_engine(None, None);
    let mut frame = Vec::new();
    ethernet::write_header(&mut frame, MacAddress::BROADCAST, CONTAINER_MAC, ETHERTYPE_ARP);
    arp::ArpPacket {
        operation: arp::OP_REQUEST,
        sender_mac: CONTAINER_MAC,
        sender_ip: CONTAINER_IP,
        target_mac: MacAddress::ZERO,
        target_ip: BRIDGE_IP,
    }
    .write_into(&mut frame);

    let reply = match engine.on_frame(&frame, &loopback_handle()) {
        Outcome::Reply(r) => r,
        Outcome::None => panic!("expected an ARP reply"),
    };

    let hdr = ethernet::EthernetHeader::parse(&reply).unwrap();
    assert_eq!(hdr.dest_mac, CONTAINER_MAC);
    let arp_reply = arp::ArpPacket::parse(hdr.payload).unwrap();
    assert_eq!(arp_reply.operation, arp::OP_REPLY);
    assert_eq!(arp_reply.sender_mac, BRIDGE_MAC);
    assert_eq!(arp_reply.sender_ip, BRIDGE_IP);
    assert_eq!(arp_reply.target_mac, MacAddress::BROADCAST);
    assert_eq!(arp_reply.target_ip, CONTAINER_IP);

    // Idempotence: replaying the reply's own bytes as a fresh ARP input
    // still parses to the same logical reply.
    let replayed = arp::ArpPacket::parse(hdr.payload).unwrap();
    assert_eq!(replayed.operation, arp_reply.operation);
    assert_eq!(replayed.sender_ip, arp_reply.sender_ip);
}

#[test]
fn scenario_2_icmp_echo() {
    let engine = test_engine(None, None);
    register_container_arp(&engine);

    let mut frame = Vec::new();
    ethernet::write_header(&mut frame, BRIDGE_MAC, CONTAINER_MAC, ETHERTYPE_IPV4);
    let mut icmp_bytes = Vec::new();
    icmp::build_echo_reply(&mut icmp_bytes, 0x1234, 1, b"hello");
    // build_echo_reply produces an ECHOREPLY; flip the type byte back to
    // ECHO REQUEST to simulate an inbound request with the same id/seq.
    icmp_bytes[0] = icmp::TYPE_ECHO_REQUEST;
    ip::Ipv4Header::write_with_payload(
        &mut frame,
        0x1234,
        ip::FLAG_DF,
        64,
        ip::PROTOCOL_ICMP,
        CONTAINER_IP,
        BRIDGE_IP,
        &icmp_bytes,
    );

    let reply = match engine.on_frame(&frame, &loopback_handle()) {
        Outcome::Reply(r) => r,
        Outcome::None => panic!("expected an ICMP echo reply"),
    };

    let eth = ethernet::EthernetHeader::parse(&reply).unwrap();
    assert_eq!(eth.dest_mac, CONTAINER_MAC);
    let (ip_hdr, ip_payload) = ip::Ipv4Header::parse(eth.payload).unwrap();
    assert_eq!(ip_hdr.ttl, 64);
    assert_eq!(ip_hdr.flags, ip::FLAG_DF);
    assert_eq!(bridge_core::addr::internet_checksum(&reply[14..14 + 20]), 0);
    assert_eq!(bridge_core::addr::internet_checksum(ip_payload), 0);

    let echo = icmp::IcmpEcho::parse(ip_payload).unwrap();
    assert_eq!(echo.icmp_type, icmp::TYPE_ECHO_REPLY);
    assert_eq!(echo.identifier, 0x1234);
    assert_eq!(echo.sequence, 1);
    assert_eq!(&echo.payload[..5], b"hello");
}

#[test]
fn scenario_3_unauthorized_ip_produces_no_outbound_frame() {
    let engine = test_engine(None, None);
    // ARP table has no entry for 10.0.0.3.
    let mut frame = Vec::new();
    ethernet::write_header(&mut frame, BRIDGE_MAC, CONTAINER_MAC, ETHERTYPE_IPV4);
    let mut icmp_bytes = Vec::new();
    icmp::build_echo_reply(&mut icmp_bytes, 1, 1, b"x");
    icmp_bytes[0] = icmp::TYPE_ECHO_REQUEST;
    ip::Ipv4Header::write_with_payload(
        &mut frame,
        1,
        ip::FLAG_DF,
        64,
        ip::PROTOCOL_ICMP,
        Ipv4Addr4::new(10, 0, 0, 3),
        BRIDGE_IP,
        &icmp_bytes,
    );

    match engine.on_frame(&frame, &loopback_handle()) {
        Outcome::None => {}
        Outcome::Reply(_) => panic!("frame from an unauthorized source must produce no reply"),
    }
}

#[test]
fn scenario_4_sctp_demultiplex_invoked_exactly_once() {
    let engine = test_engine(None, None);
    register_container_arp(&engine);

    let hit_count = Arc::new(AtomicUsize::new(0));
    let hit_count_clone = hit_count.clone();
    let seen_payload = Arc::new(Mutex::new(Vec::new()));
    let seen_payload_clone = seen_payload.clone();
    engine
        .tables
        .sctp
        .insert(
            (CONTAINER_IP, 5000),
            Arc::new(SctpEntry {
                peer_ip: CONTAINER_IP,
                peer_port: 5000,
                on_packet: Arc::new(move |payload| {
                    hit_count_clone.fetch_add(1, Ordering::SeqCst);
                    *seen_payload_clone.lock().unwrap() = payload.to_vec();
                }),
            }),
        )
        .unwrap();

    let mut frame = Vec::new();
    ethernet::write_header(&mut frame, BRIDGE_MAC, CONTAINER_MAC, ETHERTYPE_IPV4);
    let sctp_payload: [u8; 6] = [0x13, 0x88, 0xDE, 0xAD, 0xBE, 0xEF];
    ip::Ipv4Header::write_with_payload(
        &mut frame,
        1,
        ip::FLAG_DF,
        64,
        132,
        CONTAINER_IP,
        BRIDGE_IP,
        &sctp_payload,
    );

    let _ = engine.on_frame(&frame, &loopback_handle());
    assert_eq!(hit_count.load(Ordering::SeqCst), 1);
    assert_eq!(&seen_payload.lock().unwrap()[..], &sctp_payload[..]);
}

fn open_app_completion(app: Option<AppRef>, instance: Option<AppInstance>) -> (PermissionBroker, Completion) {
    let broker = PermissionBroker::new(
        Arc::new(FixedAppState(Mutex::new(app))),
        Arc::new(FixedPersona(Mutex::new(instance))),
    );
    let request = bridge_core::broker::PermissionRequest {
        event_loop: loopback_handle(),
        bridge_mac: BRIDGE_MAC,
        bridge_ip: BRIDGE_IP,
        source_mac: CONTAINER_MAC,
        source_ip: CONTAINER_IP,
        source_port: 40000,
        kind: PermissionKind::Application,
        payload: b"app://x".to_vec(),
    };
    let completion = Completion {
        request,
        status: 0,
        persona: Some(PersonaRef { id: "persona-1".into() }),
        arp_entry: Arc::new(ArpEntry::new(CONTAINER_IP, CONTAINER_MAC)),
    };
    (broker, completion)
}

#[test]
fn scenario_5_open_app_success() {
    let (broker, completion) = open_app_completion(
        Some(AppRef { url: "app://x".into() }),
        Some(AppInstance { assigned_ip: Ipv4Addr4::new(10, 0, 0, 9) }),
    );
    let frame = broker.complete(completion).expect("success must produce a response frame");

    let eth = ethernet::EthernetHeader::parse(&frame).unwrap();
    let (_ip_hdr, udp_bytes) = ip::Ipv4Header::parse(eth.payload).unwrap();
    let udp = bridge_core::packet::udp::UdpHeader::parse(udp_bytes).unwrap();
    assert_eq!(udp.src_port, bridge_core::packet::udp::APP_CONTROL_PORT);
    assert_eq!(udp.dest_port, 40000);

    let flags = u16::from_be_bytes([udp.payload[0], udp.payload[1]]);
    assert_eq!(flags, 0x8000 | 1);
    let family = u32::from_be_bytes([udp.payload[4], udp.payload[5], udp.payload[6], udp.payload[7]]);
    assert_eq!(family, 2);
    let ip_addr = u32::from_be_bytes([udp.payload[8], udp.payload[9], udp.payload[10], udp.payload[11]]);
    assert_eq!(Ipv4Addr4::from(ip_addr), Ipv4Addr4::new(10, 0, 0, 9));
}

#[test]
fn scenario_6_open_app_unknown_app_yields_error() {
    let (broker, completion) = open_app_completion(None, None);
    let frame = broker.complete(completion).expect("error completion must still produce a response frame");

    let eth = ethernet::EthernetHeader::parse(&frame).unwrap();
    let (_ip_hdr, udp_bytes) = ip::Ipv4Header::parse(eth.payload).unwrap();
    let udp = bridge_core::packet::udp::UdpHeader::parse(udp_bytes).unwrap();

    let flags = u16::from_be_bytes([udp.payload[0], udp.payload[1]]);
    assert_eq!(flags & 0x4000, 0x4000, "error bit must be set");
    let errno = u32::from_be_bytes([udp.payload[4], udp.payload[5], udp.payload[6], udp.payload[7]]);
    assert_eq!(errno, bridge_core::error::BrokerError::AppNotFound.wire_errno());
}

#[test]
fn open_app_name_len_over_max_yields_no_broker_invocation() {
    let engine = test_engine(None, None);
    register_container_arp(&engine);

    let mut frame = Vec::new();
    ethernet::write_header(&mut frame, BRIDGE_MAC, CONTAINER_MAC, ETHERTYPE_IPV4);
    let mut udp_payload = Vec::new();
    udp_payload.extend_from_slice(&(bridge_core::broker::APP_URL_MAX + 1).to_be_bytes());
    let mut udp_bytes = Vec::new();
    bridge_core::packet::udp::write_with_payload(
        &mut udp_bytes,
        40000,
        bridge_core::packet::udp::APP_CONTROL_PORT,
        &udp_payload,
    );
    ip::Ipv4Header::write_with_payload(
        &mut frame,
        1,
        ip::FLAG_DF,
        64,
        ip::PROTOCOL_UDP,
        CONTAINER_IP,
        BRIDGE_IP,
        &udp_bytes,
    );

    match engine.on_frame(&frame, &loopback_handle()) {
        Outcome::None => {}
        Outcome::Reply(_) => panic!("an oversized name_len must never reach the broker or produce a frame"),
    }
}
