//! # apd-bridged
//!
//! Daemon entry point for the appliance network bridge: builds the bridge
//! namespace, wires up the packet engine, and drives the event loop until
//! signalled to stop.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use bridge_core::addr::MacAddress;
use bridge_core::broker::PermissionBroker;
use bridge_core::engine::PacketEngine;
use bridge_core::eventloop::EventLoop;
use bridge_core::namespace::NamespaceBuilder;
use bridge_core::state::{BridgeConfig, BridgeState};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        error!("apd-bridged exiting: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = BridgeConfig::from_env();
    info!(
        "starting {} v{} (uid={} gid={} ip={})",
        bridge_core::SERVICE_NAME,
        bridge_core::VERSION,
        config.uid,
        config.gid,
        config.iproute_binary
    );

    let (net_ns_fd, user_ns_fd, mut tap) = NamespaceBuilder::init(config.uid, config.gid, &config.iproute_binary)?;
    if let Some(sink) = config.open_debug_sink()? {
        tap = bridge_core::tap::TapIo::new(
            std::os::unix::io::AsRawFd::as_raw_fd(&tap),
            Some(sink),
        );
    }

    let bridge_mac = MacAddress::random();
    info!("Opening bridge with IP address {} and mac {bridge_mac}", bridge_core::state::BRIDGE_IP);

    let broker = PermissionBroker::new(Arc::new(NullAppState), Arc::new(NullPersona));
    let engine = PacketEngine::new(bridge_mac, bridge_core::state::BRIDGE_IP, broker);
    let state = BridgeState::new(bridge_mac, net_ns_fd, user_ns_fd, tap, engine);

    let mut event_loop = EventLoop::new(std::os::unix::io::AsRawFd::as_raw_fd(&state.tap))?;
    let handle = event_loop.handle();

    loop {
        event_loop.poll_once(
            Some(Duration::from_secs(1)),
            || match state.tap.read_frame() {
                Ok(Some(frame)) => match state.engine.on_frame(&frame, &handle) {
                    bridge_core::engine::Outcome::Reply(reply) => {
                        if let Err(e) = state.tap.write_frame(&[&reply]) {
                            error!("tap write failed: {e}");
                        }
                    }
                    bridge_core::engine::Outcome::None => {}
                },
                Ok(None) => {}
                Err(e) => error!("tap read failed: {e}"),
            },
            |completion| {
                if let Some(frame) = state.engine.broker.complete(completion) {
                    if let Err(e) = state.tap.write_frame(&[&frame]) {
                        error!("tap write (completion response) failed: {e}");
                    }
                }
            },
        )?;
    }
}

struct NullAppState;
impl bridge_core::collaborators::AppState for NullAppState {
    fn get_app_by_url(&self, _name: &[u8]) -> Option<bridge_core::collaborators::AppRef> {
        None
    }
}

struct NullPersona;
impl bridge_core::collaborators::Persona for NullPersona {
    fn launch_app_instance(
        &self,
        _persona: &bridge_core::collaborators::PersonaRef,
        _app: &bridge_core::collaborators::AppRef,
    ) -> Option<bridge_core::collaborators::AppInstance> {
        None
    }
}
