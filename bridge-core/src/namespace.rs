//! # Namespace Builder
//!
//! Creates the bridge's own user+network namespace, a tap device inside
//! it, and the `bridge` Linux bridge device, then hands the three fds back
//! to the parent. A short-lived `clone()`d child passes the fds over a
//! `SOCK_DGRAM` `AF_UNIX` pair and exits, while the parent does a
//! synchronous `waitpid`.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;

use log::{debug, info};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::Signal;
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag,
    SockType,
};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::error::NamespaceError;
use crate::state::BridgeState;
use crate::tap::TapIo;

const TUNSETIFF: u64 = 0x4004_54ca;
const IFF_TAP: i16 = 0x0002;
const IFF_NO_PI: i16 = 0x1000;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: i16,
}

pub struct NamespaceBuilder;

impl NamespaceBuilder {
    /// Builds the bridge namespace and returns the net/user namespace fds
    /// plus an open tap device; callers finish wiring the packet engine
    /// and construct a [`BridgeState`] after this returns.
    pub fn init(uid: u32, gid: u32, iproute_binary: &str) -> Result<(RawFd, RawFd, TapIo), NamespaceError> {
        let (parent_sock, child_sock) =
            socketpair(AddressFamily::Unix, SockType::Datagram, None, SockFlag::empty())
                .map_err(NamespaceError::SocketPair)?;

        let mut stack = vec![0u8; 1 << 20];
        let iproute_binary = iproute_binary.to_string();
        let child_sock_fd = child_sock.as_raw_fd();

        let child_pid = unsafe {
            clone(
                Box::new(move || child_main(uid, gid, &iproute_binary, child_sock_fd)),
                &mut stack,
                CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_VFORK,
                Some(Signal::SIGCHLD as i32),
            )
            .map_err(NamespaceError::Clone)?
        };

        drop(child_sock);

        let (net_ns_fd, user_ns_fd, tap_fd) = recv_three_fds(parent_sock.as_raw_fd())?;

        nix::fcntl::fcntl(net_ns_fd, nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC))
            .map_err(NamespaceError::Clone)?;
        nix::fcntl::fcntl(user_ns_fd, nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC))
            .map_err(NamespaceError::Clone)?;
        nix::fcntl::fcntl(tap_fd, nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC))
            .map_err(NamespaceError::Clone)?;
        let flags = nix::fcntl::fcntl(tap_fd, nix::fcntl::FcntlArg::F_GETFL).map_err(NamespaceError::Clone)?;
        nix::fcntl::fcntl(
            tap_fd,
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::from_bits_truncate(flags) | nix::fcntl::OFlag::O_NONBLOCK),
        )
        .map_err(NamespaceError::Clone)?;

        match waitpid(Pid::from_raw(child_pid.as_raw()), None) {
            Ok(WaitStatus::Exited(_, 0)) => {}
            Ok(_) => return Err(NamespaceError::ChildExit),
            Err(e) => return Err(NamespaceError::Clone(e)),
        }

        info!("namespace setup complete: net_ns_fd={net_ns_fd} user_ns_fd={user_ns_fd} tap_fd={tap_fd}");
        Ok((net_ns_fd, user_ns_fd, TapIo::new(tap_fd, None)))
    }
}

/// Entry point run inside the new user+net namespaces. Never returns;
/// exits the process directly, since a `clone()` callback can't
/// meaningfully propagate a `Result` back through the split stack.
fn child_main(uid: u32, gid: u32, iproute_binary: &str, comm_fd: RawFd) -> isize {
    if let Err(e) = setup_id_maps(uid, gid) {
        eprintln!("namespace child: id map setup failed: {e}");
        return 1;
    }

    let (tap_fd, tap_name) = match open_tap() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("namespace child: tap setup failed: {e}");
            return 1;
        }
    };

    if let Err(e) = create_bridge(iproute_binary, &tap_name) {
        eprintln!("namespace child: bridge setup failed: {e}");
        return 1;
    }

    let net_ns_fd = match std::fs::File::open("/proc/self/ns/net") {
        Ok(f) => {
            let fd = f.as_raw_fd();
            std::mem::forget(f);
            fd
        }
        Err(e) => {
            eprintln!("namespace child: open /proc/self/ns/net failed: {e}");
            return 1;
        }
    };
    let user_ns_fd = match std::fs::File::open("/proc/self/ns/user") {
        Ok(f) => {
            let fd = f.as_raw_fd();
            std::mem::forget(f);
            fd
        }
        Err(e) => {
            eprintln!("namespace child: open /proc/self/ns/user failed: {e}");
            return 1;
        }
    };

    if send_three_fds(comm_fd, net_ns_fd, user_ns_fd, tap_fd).is_err() {
        eprintln!("namespace child: fd transfer failed");
        return 1;
    }

    0
}

/// Denies setgroups, writes gid/uid maps, then becomes root inside the
/// new namespace.
fn setup_id_maps(uid: u32, gid: u32) -> std::io::Result<()> {
    std::fs::write("/proc/self/setgroups", "deny")?;
    std::fs::OpenOptions::new()
        .write(true)
        .open("/proc/self/gid_map")?
        .write_all(format!("0 {gid} 1\n").as_bytes())?;
    std::fs::OpenOptions::new()
        .write(true)
        .open("/proc/self/uid_map")?
        .write_all(format!("0 {uid} 1\n").as_bytes())?;

    nix::unistd::setresuid(0.into(), 0.into(), 0.into()).map_err(std::io::Error::from)?;
    nix::unistd::setresgid(0.into(), 0.into(), 0.into()).map_err(std::io::Error::from)?;
    Ok(())
}

/// Opens `/dev/net/tun` and issues `TUNSETIFF` for a TAP device with no
/// packet info.
fn open_tap() -> std::io::Result<(RawFd, String)> {
    let file = OpenOptions::new().read(true).write(true).open("/dev/net/tun")?;
    let fd = file.as_raw_fd();

    let mut ifr = IfReqFlags {
        ifr_name: [0u8; libc::IFNAMSIZ],
        ifr_flags: IFF_TAP | IFF_NO_PI,
    };
    let rc = unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr as *mut IfReqFlags) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    std::mem::forget(file);

    let name_end = ifr.ifr_name.iter().position(|&b| b == 0).unwrap_or(ifr.ifr_name.len());
    let name = String::from_utf8_lossy(&ifr.ifr_name[..name_end]).into_owned();
    Ok((fd, name))
}

/// Runs the five `ip` invocations that wire up the bridge (create bridge,
/// `lo` up, enslave tap, tap up, bridge up), in order, failing on the
/// first non-zero exit.
fn create_bridge(iproute_binary: &str, tap_name: &str) -> Result<(), NamespaceError> {
    let commands: [Vec<&str>; 5] = [
        vec!["link", "add", "bridge", "type", "bridge"],
        vec!["link", "set", "dev", "lo", "up"],
        vec!["link", "set", "dev", tap_name, "master", "bridge"],
        vec!["link", "set", "dev", tap_name, "up", "multicast", "off"],
        vec!["link", "set", "dev", "bridge", "up", "multicast", "off"],
    ];

    for args in commands {
        run_ip(iproute_binary, &args)?;
    }
    Ok(())
}

pub(crate) fn run_ip(iproute_binary: &str, args: &[&str]) -> Result<(), NamespaceError> {
    let joined = args.join(" ");
    let status = Command::new(iproute_binary)
        .args(args)
        .status()
        .map_err(|source| NamespaceError::IpTool { args: joined.clone(), source })?;
    if !status.success() {
        return Err(NamespaceError::IpToolStatus { args: joined });
    }
    debug!("ran `{iproute_binary} {joined}`");
    Ok(())
}

fn send_three_fds(sock_fd: RawFd, a: RawFd, b: RawFd, c: RawFd) -> nix::Result<()> {
    let fds = [a, b, c];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(sock_fd, &[std::io::IoSlice::new(&[0u8])], &cmsg, MsgFlags::empty(), None)?;
    Ok(())
}

fn recv_three_fds(sock_fd: RawFd) -> Result<(RawFd, RawFd, RawFd), NamespaceError> {
    let mut buf = [0u8; 1];
    let mut iov = [std::io::IoSliceMut::new(&mut buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 3]);
    let msg = recvmsg::<()>(sock_fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
        .map_err(|_| NamespaceError::FdTransfer(std::io::Error::last_os_error()))?;

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if fds.len() == 3 {
                return Ok((fds[0], fds[1], fds[2]));
            }
        }
    }
    Err(NamespaceError::FdTransfer(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "did not receive exactly three fds",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_pass_roundtrip_over_unix_datagram_pair() {
        let (a, b) = socketpair(AddressFamily::Unix, SockType::Datagram, None, SockFlag::empty()).unwrap();
        let stdin_fd = std::io::stdin().as_raw_fd();
        send_three_fds(a.as_raw_fd(), stdin_fd, stdin_fd, stdin_fd).unwrap();
        let (x, y, z) = recv_three_fds(b.as_raw_fd()).unwrap();
        assert!(x >= 0 && y >= 0 && z >= 0);
        let _ = nix::unistd::close(x);
        let _ = nix::unistd::close(y);
        let _ = nix::unistd::close(z);
    }
}
