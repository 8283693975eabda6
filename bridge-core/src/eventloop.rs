//! # Event Loop
//!
//! Single-threaded cooperative dispatch: the tap fd and queued completion
//! events are the only suspension points; table lookups never block and
//! the packet engine runs to completion on one frame. Long operations
//! (namespace construction, veth provisioning, application launch) run on
//! worker threads and post completions back here through an `mpsc`
//! channel woken by an `mio::Waker`.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::broker::Completion;

pub const TAP_TOKEN: Token = Token(0);
pub const WAKE_TOKEN: Token = Token(1);

/// Cloneable, thread-safe sender used by worker threads to post a
/// completion event and wake the event loop.
#[derive(Clone)]
pub struct EventLoopHandle {
    completions: mpsc::Sender<Completion>,
    waker: Arc<Waker>,
}

impl EventLoopHandle {
    pub fn post_completion(&self, completion: Completion) -> io::Result<()> {
        self.completions
            .send(completion)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "event loop gone"))?;
        self.waker.wake()
    }
}

/// Drives the tap fd and the completion channel. Owns no bridge state
/// itself — callers supply closures for "tap became readable" and "a
/// completion arrived" so this module stays free of a direct dependency
/// on [`crate::state::BridgeState`] or [`crate::engine::PacketEngine`].
pub struct EventLoop {
    poll: Poll,
    events: Events,
    completions_rx: mpsc::Receiver<Completion>,
    handle: EventLoopHandle,
}

impl EventLoop {
    pub fn new(tap_fd: RawFd) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        poll.registry()
            .register(&mut SourceFd(&tap_fd), TAP_TOKEN, Interest::READABLE)?;

        let (tx, rx) = mpsc::channel();
        Ok(Self {
            poll,
            events: Events::with_capacity(128),
            completions_rx: rx,
            handle: EventLoopHandle {
                completions: tx,
                waker,
            },
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    /// Blocks for the next batch of readiness events (tap readable, or a
    /// completion waking us), dispatching to `on_tap_readable` / `on_completion`.
    /// Returns after at least one event is processed, or on timeout.
    pub fn poll_once<F, G>(
        &mut self,
        timeout: Option<Duration>,
        mut on_tap_readable: F,
        mut on_completion: G,
    ) -> io::Result<()>
    where
        F: FnMut(),
        G: FnMut(Completion),
    {
        self.poll.poll(&mut self.events, timeout)?;
        for event in self.events.iter() {
            match event.token() {
                TAP_TOKEN => on_tap_readable(),
                WAKE_TOKEN => {
                    while let Ok(completion) = self.completions_rx.try_recv() {
                        on_completion(completion);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Trait object escape hatch for tests and [`crate::tap::TapIo`] to report
/// their raw fd without importing `mio` directly.
pub trait RegisterableFd: AsRawFd {}
impl<T: AsRawFd> RegisterableFd for T {}

/// Lets other modules' tests build an [`EventLoopHandle`] without standing
/// up a full [`EventLoop`] (which needs a real pollable fd). Gated behind
/// `test-support` (rather than plain `cfg(test)`) so the integration
/// tests under `tests/`, which compile this crate as an ordinary
/// dependency, can reach it too.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;

    pub fn handle_for_tests(completions: mpsc::Sender<Completion>, waker: Arc<Waker>) -> EventLoopHandle {
        EventLoopHandle { completions, waker }
    }
}
