//! Keeping upstream sockets out of the tunnel
//!
//! A DoH connection opened from inside a VPN would be routed straight back
//! into the VPN's own TUN device. Before connecting, every upstream socket is
//! handed to a [`SocketProtector`]; returning `false` aborts that connection
//! attempt only.

#[cfg(unix)]
use std::os::unix::io::RawFd;
#[cfg(unix)]
use std::path::{Path, PathBuf};
#[cfg(unix)]
use std::time::Duration;

#[cfg(not(unix))]
pub type RawFd = i32;

/// Excludes a socket from the tunnel's routing
pub trait SocketProtector: Send + Sync {
    /// Protect the socket behind `fd`; `false` means it must not be used
    fn protect(&self, fd: RawFd) -> bool;
}

impl<F> SocketProtector for F
where
    F: Fn(RawFd) -> bool + Send + Sync,
{
    fn protect(&self, fd: RawFd) -> bool {
        self(fd)
    }
}

/// Protector for hosts that route upstream traffic outside the tunnel by
/// other means
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _fd: RawFd) -> bool {
        true
    }
}

/// Send/receive timeout for the protect handshake
#[cfg(unix)]
pub const PROTECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Passes each socket to a host service over a Unix domain socket.
///
/// The fd travels as `SCM_RIGHTS` ancillary data; the service protects it
/// and answers with a single byte.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixSocketProtector {
    path: PathBuf,
}

#[cfg(unix)]
impl UnixSocketProtector {
    /// Create a protector talking to the service listening at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the protect service socket
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn send_fd(&self, fd: RawFd) -> std::io::Result<()> {
        use std::io::Read;
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

        let mut stream = UnixStream::connect(&self.path)?;
        stream.set_read_timeout(Some(PROTECT_TIMEOUT))?;
        stream.set_write_timeout(Some(PROTECT_TIMEOUT))?;

        // Stream sockets drop ancillary data sent without payload
        let payload = [0u8; 1];
        let iov = [std::io::IoSlice::new(&payload)];
        let fds = [fd];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
            .map_err(std::io::Error::from)?;

        let mut ack = [0u8; 1];
        let n = stream.read(&mut ack)?;
        if n != 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "protect service closed the connection",
            ));
        }
        Ok(())
    }
}

#[cfg(unix)]
impl SocketProtector for UnixSocketProtector {
    fn protect(&self, fd: RawFd) -> bool {
        match self.send_fd(fd) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "Failed to protect fd {} via {}: {}",
                    fd,
                    self.path.display(),
                    e
                );
                false
            }
        }
    }
}

/// Tags each socket with a firewall mark so policy routing can bypass the
/// tunnel (Linux only, needs `CAP_NET_ADMIN`)
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
pub struct MarkProtector {
    mark: u32,
}

#[cfg(target_os = "linux")]
impl MarkProtector {
    pub fn new(mark: u32) -> Self {
        Self { mark }
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }
}

#[cfg(target_os = "linux")]
impl SocketProtector for MarkProtector {
    fn protect(&self, fd: RawFd) -> bool {
        let mark = self.mark as libc::c_int;
        // SAFETY: `fd` is an open socket owned by the caller and `mark`
        // outlives the call.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_MARK,
                &mark as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            log::warn!(
                "Failed to set SO_MARK {} on fd {}: {}",
                self.mark,
                fd,
                std::io::Error::last_os_error()
            );
            return false;
        }
        true
    }
}
