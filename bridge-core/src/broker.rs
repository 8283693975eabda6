//! # Permission Broker
//!
//! Handles the application-launch control protocol on UDP port 9998.
//! Request handling runs on the event-loop thread and never blocks past
//! taking the ARP table's write lock; completion is delivered
//! asynchronously from worker threads through
//! [`crate::eventloop::EventLoopHandle::post_completion`], a
//! request/response correlation pattern over a completion channel rather
//! than a direct call.

use std::sync::Arc;

use log::{debug, warn};

use crate::addr::{Ipv4Addr4, MacAddress};
use crate::collaborators::{AppState, Persona, PersonaRef};
use crate::error::{BrokerError, PacketError};
use crate::eventloop::EventLoopHandle;
use crate::packet::{ethernet, ip, udp};
use crate::tables::{AddressTables, ArpEntry};

/// `app_name_length` ceiling.
pub const APP_URL_MAX: u32 = 2048;

const OP_OPEN_APP: u16 = 1;
const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_ERROR: u16 = 0x4000;
const AF_INET: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionKind {
    Application,
}

/// An in-flight `open-app` request, created when a valid request arrives
/// and destroyed after the response frame is written.
pub struct PermissionRequest {
    pub event_loop: EventLoopHandle,
    pub bridge_mac: MacAddress,
    pub bridge_ip: Ipv4Addr4,
    pub source_mac: MacAddress,
    pub source_ip: Ipv4Addr4,
    pub source_port: u16,
    pub kind: PermissionKind,
    pub payload: Vec<u8>,
}

/// Posted back onto the event loop once the external persona/application
/// subsystem resolves (or fails) a [`PermissionRequest`].
pub struct Completion {
    pub request: PermissionRequest,
    /// Negative on failure.
    pub status: i32,
    pub persona: Option<PersonaRef>,
    /// The ARP entry `handle_request` resolved this request against, so a
    /// successful launch can hand the container back its release-to-running
    /// callback.
    pub arp_entry: Arc<ArpEntry>,
}

/// Ties together the two external collaborators needed to resolve an
/// `open-app` completion.
pub struct PermissionBroker {
    app_state: Arc<dyn AppState>,
    persona: Arc<dyn Persona>,
}

impl PermissionBroker {
    pub fn new(app_state: Arc<dyn AppState>, persona: Arc<dyn Persona>) -> Self {
        Self { app_state, persona }
    }

    /// Parses and dispatches an inbound UDP :9998 payload. Returns
    /// `Ok(Some(request))` when a [`PermissionRequest`] was handed to the
    /// permission callback (caller owns invoking it); `Ok(None)` when the
    /// frame was validated and silently dropped (no ARP entry, or no
    /// permission callback — not an error, just a drop); `Err` on
    /// malformed input.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_request(
        &self,
        tables: &AddressTables,
        event_loop: EventLoopHandle,
        bridge_mac: MacAddress,
        bridge_ip: Ipv4Addr4,
        source_mac: MacAddress,
        source_ip: Ipv4Addr4,
        source_port: u16,
        payload: &[u8],
    ) -> Result<Option<(Arc<ArpEntry>, PermissionRequest)>, PacketError> {
        if payload.len() < 4 {
            return Err(PacketError::MalformedUdp);
        }
        let name_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if name_len > APP_URL_MAX {
            return Err(PacketError::AppNameTooLong {
                len: name_len,
                max: APP_URL_MAX,
            });
        }
        let name_end = 4 + name_len as usize;
        if payload.len() < name_end {
            return Err(PacketError::MalformedUdp);
        }
        let name = payload[4..name_end].to_vec();

        let arp_entry = match tables.arp.lookup_serialized(&source_ip) {
            Some(entry) => entry,
            None => {
                debug!("open-app from {source_ip} with no ARP entry, dropping");
                return Ok(None);
            }
        };
        if arp_entry.permission_callback.is_none() {
            debug!("open-app from {source_ip} has no permission callback, dropping");
            return Ok(None);
        }

        let request = PermissionRequest {
            event_loop,
            bridge_mac,
            bridge_ip,
            source_mac,
            source_ip,
            source_port,
            kind: PermissionKind::Application,
            payload: name,
        };
        Ok(Some((arp_entry, request)))
    }

    /// Resolves a [`Completion`] into a wire response frame. Returns
    /// `None` when the right behavior is to log and drop rather than
    /// respond (launch failure).
    pub fn complete(&self, completion: Completion) -> Option<Vec<u8>> {
        let Completion {
            request,
            status,
            persona,
            arp_entry,
        } = completion;

        if status < 0 {
            return Some(self.error_frame(&request, BrokerError::Denied));
        }
        let Some(persona) = persona else {
            return Some(self.error_frame(&request, BrokerError::PersonaMissing));
        };
        let Some(app) = self.app_state.get_app_by_url(&request.payload) else {
            return Some(self.error_frame(&request, BrokerError::AppNotFound));
        };
        let Some(instance) = self.persona.launch_app_instance(&persona, &app) else {
            warn!("persona {} failed to launch {}", persona.id, app.url);
            return None;
        };

        if let Some(container) = arp_entry.container.as_ref().and_then(|c| c.upgrade()) {
            container.release_running(&request.event_loop);
        }

        Some(self.success_frame(&request, instance.assigned_ip))
    }

    fn success_frame(&self, request: &PermissionRequest, assigned_ip: Ipv4Addr4) -> Vec<u8> {
        let mut body = Vec::with_capacity(12);
        let flags = FLAG_RESPONSE | OP_OPEN_APP;
        body.extend_from_slice(&flags.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes()); // reserved
        body.extend_from_slice(&AF_INET.to_be_bytes());
        body.extend_from_slice(&u32::from(assigned_ip).to_be_bytes());
        self.build_response_frame(request, &body)
    }

    fn error_frame(&self, request: &PermissionRequest, err: BrokerError) -> Vec<u8> {
        let mut body = Vec::with_capacity(8);
        let flags = FLAG_RESPONSE | FLAG_ERROR | OP_OPEN_APP;
        body.extend_from_slice(&flags.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes()); // reserved
        body.extend_from_slice(&err.wire_errno().to_be_bytes());
        self.build_response_frame(request, &body)
    }

    fn build_response_frame(&self, request: &PermissionRequest, body: &[u8]) -> Vec<u8> {
        let mut udp_bytes = Vec::new();
        udp::write_with_payload(&mut udp_bytes, udp::APP_CONTROL_PORT, request.source_port, body);

        let mut frame = Vec::new();
        ethernet::write_header(
            &mut frame,
            request.source_mac,
            request.bridge_mac,
            crate::addr::ETHERTYPE_IPV4,
        );
        ip::Ipv4Header::write_with_payload(
            &mut frame,
            0xBEEF,
            ip::FLAG_DF,
            64,
            ip::PROTOCOL_UDP,
            request.bridge_ip,
            request.source_ip,
            &udp_bytes,
        );
        frame
    }
}
