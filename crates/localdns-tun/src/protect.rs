//! Keeps relay sockets from being routed back into the tunnel.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use localdns_core::config::RelayConfig;

/// Exempts a real outbound socket from tunnel routing.
///
/// Called on every socket before it connects.
pub trait SocketProtector: Send + Sync {
    fn protect(&self, fd: RawFd) -> io::Result<()>;
}

/// For setups where routing already excludes the relay's own traffic.
#[derive(Debug, Default)]
pub struct NoProtect;

impl SocketProtector for NoProtect {
    fn protect(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }
}

/// Linux socket options steering traffic around the tunnel: a policy-routing
/// mark (`SO_MARK`) and/or binding to the physical interface (`SO_BINDTODEVICE`).
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    pub fwmark: Option<u32>,
    pub bind_interface: Option<String>,
}

impl SocketProtector for SocketOptions {
    fn protect(&self, fd: RawFd) -> io::Result<()> {
        if let Some(interface) = &self.bind_interface {
            set_bind_device(fd, interface)?;
        }
        if let Some(mark) = self.fwmark {
            set_routing_mark(fd, mark)?;
        }
        Ok(())
    }
}

/// Pick the protector described by the relay configuration.
pub fn from_config(config: &RelayConfig) -> Arc<dyn SocketProtector> {
    if config.fwmark.is_none() && config.bind_interface.is_none() {
        return Arc::new(NoProtect);
    }
    tracing::info!(
        fwmark = ?config.fwmark,
        interface = ?config.bind_interface,
        "real sockets bypass the tunnel via socket options"
    );
    Arc::new(SocketOptions {
        fwmark: config.fwmark,
        bind_interface: config.bind_interface.clone(),
    })
}

#[cfg(target_os = "linux")]
const IFNAMSIZ: usize = 16;

#[cfg(target_os = "linux")]
fn set_bind_device(fd: RawFd, interface: &str) -> io::Result<()> {
    if interface.len() >= IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name too long: {}", interface),
        ));
    }

    let mut ifname = [0u8; IFNAMSIZ];
    ifname[..interface.len()].copy_from_slice(interface.as_bytes());

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            ifname.as_ptr().cast::<libc::c_void>(),
            ifname.len() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    tracing::trace!(fd, interface, "socket bound to interface");
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_routing_mark(fd: RawFd, mark: u32) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            std::ptr::addr_of!(mark).cast::<libc::c_void>(),
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    tracing::trace!(fd, mark, "routing mark set");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_bind_device(_fd: RawFd, _interface: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_BINDTODEVICE is only available on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
fn set_routing_mark(_fd: RawFd, _mark: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_MARK is only available on Linux",
    ))
}
