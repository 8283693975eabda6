//! # Tap I/O
//!
//! Reads and writes frames on the tap fd created by
//! [`crate::namespace::NamespaceBuilder`]. Writes are serialized by a
//! dedicated mutex so concurrent `writev` calls never interleave; an
//! optional debug sink mirrors every inbound/outbound frame as hex text
//! under a separate mutex, keeping the log-write path independent from
//! the data-write path.

use std::io::{self, IoSlice, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// One full frame read never exceeds this.
pub const READ_BUFFER_SIZE: usize = 2048;

pub trait DebugSink: Send + Sync {
    fn record(&self, direction: char, data: &[u8]);
}

/// Appends `<dir> HH:MM:SS.000000 0000 <hex bytes>` lines. `I` for
/// inbound, `O` for outbound.
pub struct FileDebugSink {
    file: Mutex<std::fs::File>,
}

impl FileDebugSink {
    pub fn open(path: &std::path::Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl DebugSink for FileDebugSink {
    fn record(&self, direction: char, data: &[u8]) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let secs = now.as_secs() % 86400;
        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        let mut hex = String::with_capacity(data.len() * 2);
        for byte in data {
            hex.push_str(&format!("{byte:02x}"));
        }
        let line = format!("{direction} {h:02}:{m:02}:{s:02}.000000 0000 {hex}\n");
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

/// Owns the tap fd. Does not own the underlying namespace fds — those
/// belong to [`crate::state::BridgeState`].
pub struct TapIo {
    fd: RawFd,
    write_lock: Mutex<()>,
    debug_sink: Option<Box<dyn DebugSink>>,
}

impl TapIo {
    pub fn new(fd: RawFd, debug_sink: Option<Box<dyn DebugSink>>) -> Self {
        Self {
            fd,
            write_lock: Mutex::new(()),
            debug_sink,
        }
    }

    /// Performs one frame read into a fixed-size buffer. Returns `Ok(None)`
    /// on a recoverable read failure; callers re-poll on the next
    /// readiness event.
    pub fn read_frame(&self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        // SAFETY: `fd` is a valid, open tap fd owned by this struct for its
        // entire lifetime; borrowing it as a `File` here does not transfer
        // ownership or close it on drop since we immediately `forget` it.
        let mut file = unsafe { std::fs::File::from_raw_fd(self.fd) };
        let result = file.read(&mut buf);
        std::mem::forget(file);

        match result {
            Ok(0) => Ok(None),
            Ok(n) => {
                let frame = buf[..n].to_vec();
                if let Some(sink) = &self.debug_sink {
                    sink.record('I', &frame);
                }
                Ok(Some(frame))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes one frame as a scatter-gather `writev`, serialized by the
    /// write mutex so concurrent writers never interleave.
    pub fn write_frame(&self, iov: &[&[u8]]) -> io::Result<usize> {
        let _guard = self.write_lock.lock().expect("tap write lock poisoned");
        let slices: Vec<IoSlice<'_>> = iov.iter().map(|b| IoSlice::new(b)).collect();

        let mut file = unsafe { std::fs::File::from_raw_fd(self.fd) };
        let result = file.write_vectored(&slices);
        std::mem::forget(file);

        if let (Ok(n), Some(sink)) = (&result, &self.debug_sink) {
            let mut joined = Vec::with_capacity(*n);
            for slice in iov {
                joined.extend_from_slice(slice);
            }
            sink.record('O', &joined);
        }
        result
    }
}

impl AsRawFd for TapIo {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

use std::os::unix::io::FromRawFd;

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn write_frame_serializes_and_mirrors_to_debug_sink() {
        use std::sync::Arc;

        let (a, b) = UnixDatagram::pair().unwrap();
        let fd = a.as_raw_fd();
        std::mem::forget(a); // TapIo now owns this fd for the test's duration

        struct VecSink(Arc<Mutex<Vec<(char, Vec<u8>)>>>);
        impl DebugSink for VecSink {
            fn record(&self, direction: char, data: &[u8]) {
                self.0.lock().unwrap().push((direction, data.to_vec()));
            }
        }
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let tap = TapIo::new(fd, Some(Box::new(VecSink(recorded.clone()))));

        tap.write_frame(&[&[1, 2], &[3, 4]]).unwrap();

        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4]);

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, 'O');
        assert_eq!(recorded[0].1, vec![1, 2, 3, 4]);
    }
}
