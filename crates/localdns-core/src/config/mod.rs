use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::dns::{parse_hosts, HostEntries};

/// Top-level configuration for LocalDNS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Tunnel interface settings.
    #[serde(default)]
    pub tun: TunSettings,

    /// Packet relay tuning.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Host override source.
    #[serde(default)]
    pub hosts: HostsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunSettings {
    #[serde(default = "default_tun_name")]
    pub name: String,
    #[serde(default = "default_tun_address")]
    pub address: Ipv4Addr,
    #[serde(default = "default_tun_netmask")]
    pub netmask: Ipv4Addr,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for TunSettings {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            address: default_tun_address(),
            netmask: default_tun_netmask(),
            mtu: default_mtu(),
        }
    }
}

fn default_tun_name() -> String {
    "localdns0".to_string()
}

fn default_tun_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 111, 0, 2)
}

fn default_tun_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

fn default_mtu() -> u16 {
    1500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Capacity of every pooled packet buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Capacity of each of the three packet queues.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Upper bound on a single selector wait.
    #[serde(default = "default_select_timeout_ms")]
    pub select_timeout_ms: u64,
    #[serde(default = "default_udp_idle_timeout_secs")]
    pub udp_idle_timeout_secs: u64,
    /// Maximum concurrent UDP flows; the least recently used flow is evicted past this.
    #[serde(default = "default_udp_max_flows")]
    pub udp_max_flows: usize,
    #[serde(default = "default_tcp_idle_timeout_secs")]
    pub tcp_idle_timeout_secs: u64,
    #[serde(default = "default_tcp_connect_timeout_secs")]
    pub tcp_connect_timeout_secs: u64,
    /// How often idle flows are swept.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// TTL placed on synthesized answers.
    #[serde(default)]
    pub dns_ttl_secs: u32,
    /// Drop multicast DNS (port 5353) instead of relaying it.
    #[serde(default = "default_true")]
    pub drop_mdns: bool,
    /// Routing mark applied to real sockets (Linux `SO_MARK`).
    #[serde(default)]
    pub fwmark: Option<u32>,
    /// Interface real sockets are bound to (Linux `SO_BINDTODEVICE`).
    #[serde(default)]
    pub bind_interface: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            queue_capacity: default_queue_capacity(),
            select_timeout_ms: default_select_timeout_ms(),
            udp_idle_timeout_secs: default_udp_idle_timeout_secs(),
            udp_max_flows: default_udp_max_flows(),
            tcp_idle_timeout_secs: default_tcp_idle_timeout_secs(),
            tcp_connect_timeout_secs: default_tcp_connect_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            dns_ttl_secs: 0,
            drop_mdns: true,
            fwmark: None,
            bind_interface: None,
        }
    }
}

impl RelayConfig {
    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }

    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_idle_timeout_secs)
    }

    pub fn tcp_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_connect_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_buffer_size() -> usize {
    16384
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_select_timeout_ms() -> u64 {
    100
}

fn default_udp_idle_timeout_secs() -> u64 {
    60
}

fn default_udp_max_flows() -> usize {
    50
}

fn default_tcp_idle_timeout_secs() -> u64 {
    300
}

fn default_tcp_connect_timeout_secs() -> u64 {
    10
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostsConfig {
    /// Hosts text file; relative paths resolve against the config file's directory.
    #[serde(default = "default_hosts_file")]
    pub file: PathBuf,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            file: default_hosts_file(),
        }
    }
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from("hosts.txt")
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        if config.hosts.file.is_relative() {
            if let Some(dir) = path.parent() {
                config.hosts.file = dir.join(&config.hosts.file);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Generate a default configuration.
    pub fn default_config() -> Self {
        Self {
            general: GeneralConfig::default(),
            tun: TunSettings::default(),
            relay: RelayConfig::default(),
            hosts: HostsConfig::default(),
        }
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tun.mtu < 576 {
            anyhow::bail!("tun.mtu must be at least 576, got {}", self.tun.mtu);
        }
        if self.relay.buffer_size < self.tun.mtu as usize {
            anyhow::bail!(
                "relay.buffer_size ({}) must be at least tun.mtu ({})",
                self.relay.buffer_size,
                self.tun.mtu
            );
        }
        if self.relay.queue_capacity == 0 {
            anyhow::bail!("relay.queue_capacity must be non-zero");
        }
        if self.relay.udp_max_flows == 0 {
            anyhow::bail!("relay.udp_max_flows must be non-zero");
        }
        Ok(())
    }

    /// Read and parse the configured hosts file.
    pub fn load_hosts(&self) -> anyhow::Result<HostEntries> {
        let text = std::fs::read_to_string(&self.hosts.file)
            .with_context(|| format!("failed to read {}", self.hosts.file.display()))?;
        parse_hosts(&text).with_context(|| format!("invalid hosts file {}", self.hosts.file.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.tun.mtu, 1500);
        assert_eq!(config.relay.udp_max_flows, 50);
        assert_eq!(config.relay.dns_ttl_secs, 0);
        assert!(config.relay.drop_mdns);
        assert!(config.relay.fwmark.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_override() {
        let yaml = "
tun:
  name: test0
  mtu: 1400
relay:
  tcp_idle_timeout_secs: 30
  fwmark: 255
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tun.name, "test0");
        assert_eq!(config.tun.mtu, 1400);
        assert_eq!(config.tun.address, Ipv4Addr::new(10, 111, 0, 2));
        assert_eq!(config.relay.tcp_idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.relay.fwmark, Some(255));
    }

    #[test]
    fn test_validate_rejects_small_buffers() {
        let mut config = Config::default_config();
        config.relay.buffer_size = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_resolves_hosts_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "hosts:\n  file: my-hosts.txt\n").unwrap();
        std::fs::write(dir.path().join("my-hosts.txt"), "1.2.3.4 example.com\n").unwrap();

        let config = Config::load(&config_path).unwrap();
        assert_eq!(config.hosts.file, dir.path().join("my-hosts.txt"));

        let entries = config.load_hosts().unwrap();
        assert_eq!(entries, vec![("example.com.".to_string(), Ipv4Addr::new(1, 2, 3, 4))]);
    }

    #[test]
    fn test_default_config_roundtrips_through_yaml() {
        let yaml = serde_yaml::to_string(&Config::default_config()).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.tun.name, "localdns0");
        assert_eq!(parsed.relay.buffer_size, 16384);
    }
}
