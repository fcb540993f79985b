use std::fs::File;
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, OwnedFd};

use localdns_core::config::TunSettings;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

#[derive(Debug, Error)]
pub enum TunError {
    #[error("TUN device creation failed: {0}")]
    CreateFailed(String),
    #[error("TUN device not supported on this platform")]
    NotSupported,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration for creating a TUN device.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Name of the TUN device (e.g., "localdns0").
    pub name: String,
    /// IP address to assign to the device.
    pub address: Ipv4Addr,
    /// Netmask for the device.
    pub netmask: Ipv4Addr,
    /// MTU for the device.
    pub mtu: u16,
}

impl From<&TunSettings> for TunConfig {
    fn from(settings: &TunSettings) -> Self {
        Self {
            name: settings.name.clone(),
            address: settings.address,
            netmask: settings.netmask,
            mtu: settings.mtu,
        }
    }
}

/// Non-blocking tunnel descriptor registered with the tokio reactor.
///
/// Each `recv` returns one IP datagram and each `send` writes one.
pub struct TunDevice {
    fd: AsyncFd<File>,
    name: String,
}

impl TunDevice {
    /// Create and configure a new TUN device (Linux implementation).
    #[cfg(target_os = "linux")]
    pub fn create(config: &TunConfig) -> Result<Self, TunError> {
        tracing::info!(name = %config.name, "creating TUN device");

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|e| TunError::CreateFailed(format!("failed to open /dev/net/tun: {}", e)))?;

        // struct ifreq with ifr_flags = IFF_TUN | IFF_NO_PI
        const IFF_TUN: libc::c_short = 0x0001;
        const IFF_NO_PI: libc::c_short = 0x1000;
        const TUNSETIFF: libc::c_ulong = 0x400454CA;

        let mut ifr = [0u8; 40];
        let name_bytes = config.name.as_bytes();
        let copy_len = name_bytes.len().min(15);
        ifr[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let flags = (IFF_TUN | IFF_NO_PI) as u16;
        ifr[16..18].copy_from_slice(&flags.to_ne_bytes());

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, ifr.as_ptr()) };
        if ret < 0 {
            return Err(TunError::CreateFailed(format!(
                "TUNSETIFF failed: {}",
                io::Error::last_os_error()
            )));
        }

        let ip_cmd = format!(
            "ip addr add {}/{} dev {} && ip link set {} up mtu {}",
            config.address,
            netmask_to_prefix(config.netmask),
            config.name,
            config.name,
            config.mtu,
        );

        let status = std::process::Command::new("sh")
            .args(["-c", &ip_cmd])
            .status();

        match status {
            Ok(s) if s.success() => {
                tracing::info!(name = %config.name, mtu = config.mtu, "TUN device created and configured");
            }
            Ok(s) => {
                tracing::warn!(name = %config.name, status = %s, "TUN device created but IP configuration failed");
            }
            Err(e) => {
                tracing::warn!(name = %config.name, error = %e, "failed to run ip commands");
            }
        }

        Self::from_file(file, config.name.clone())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn create(_config: &TunConfig) -> Result<Self, TunError> {
        Err(TunError::NotSupported)
    }

    /// Adopt an already-open tunnel descriptor handed over by a supervisor.
    pub fn from_fd(fd: OwnedFd, name: impl Into<String>) -> Result<Self, TunError> {
        Self::from_file(File::from(fd), name.into())
    }

    fn from_file(file: File, name: String) -> Result<Self, TunError> {
        set_nonblocking(&file)?;
        let fd = AsyncFd::with_interest(file, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self { fd, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one packet. Returns 0 when the peer has closed the descriptor.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write one packet, returning the number of bytes accepted.
    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        tracing::debug!(name = %self.name, "TUN device closed");
    }
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Convert a netmask to CIDR prefix length.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn netmask_to_prefix(netmask: Ipv4Addr) -> u8 {
    let bits = u32::from(netmask);
    bits.count_ones() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn test_netmask_to_prefix() {
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 0)), 24);
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 0, 0)), 16);
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 0, 0, 0)), 8);
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 255)), 32);
    }

    #[tokio::test]
    async fn test_adopted_fd_keeps_datagram_boundaries() {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        let device = TunDevice::from_fd(OwnedFd::from(ours), "test0").unwrap();
        assert_eq!(device.name(), "test0");

        theirs.send(b"first").unwrap();
        theirs.send(b"second packet").unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(device.recv(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"first");
        assert_eq!(device.recv(&mut buf).await.unwrap(), 13);

        assert_eq!(device.send(b"reply").await.unwrap(), 5);
        let n = theirs.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");
    }
}
