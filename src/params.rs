//! Connection parameters.
//!
//! Values are layered: built-in defaults, then an optional YAML document,
//! then `CBSDK_*` environment variables, then explicit builder setters.
//! [`ParamsBuilder::build`] fills in the platform-specific local adapter.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SdkError};
use crate::packet::HEADER_SIZE;

/// Well-known UDP port on both ends
pub const DEFAULT_PORT: u16 = 51002;
pub const DEFAULT_INST_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 137, 128);
/// Subnet broadcast address the Linux client binds to
pub const LINUX_CLIENT_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 137, 255);
pub const DEFAULT_QUEUE_CAPACITY: usize = 65_536;
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_535;

#[cfg(windows)]
pub const DEFAULT_RECV_BUF_SIZE: usize = 8 * 1024 * 1024;
#[cfg(not(windows))]
pub const DEFAULT_RECV_BUF_SIZE: usize = 6 * 1024 * 1024;

const ENV_INST_ADDR: &str = "CBSDK_INST_ADDR";
const ENV_INST_PORT: &str = "CBSDK_INST_PORT";
const ENV_CLIENT_ADDR: &str = "CBSDK_CLIENT_ADDR";
const ENV_CLIENT_PORT: &str = "CBSDK_CLIENT_PORT";
const ENV_RECV_BUFSIZE: &str = "CBSDK_RECV_BUFSIZE";

/// Resolved connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    pub inst_addr: IpAddr,
    pub inst_port: u16,
    pub client_addr: IpAddr,
    pub client_port: u16,
    /// Requested `SO_RCVBUF`; 0 leaves the OS default
    pub recv_buf_size: usize,
    /// Handoff queue capacity in packets
    pub queue_capacity: usize,
    pub reply_timeout_ms: u64,
    pub config_timeout_ms: u64,
    pub max_datagram_size: usize,
}

impl Params {
    pub fn builder() -> ParamsBuilder {
        ParamsBuilder::default()
    }

    /// Parse a YAML document and resolve it with [`ParamsBuilder::build`].
    ///
    /// Missing keys take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        ParamsBuilder::from_yaml(yaml)?.build()
    }

    /// Instrument endpoint.
    pub fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.inst_addr, self.inst_port)
    }

    /// Local bind endpoint.
    pub fn local(&self) -> SocketAddr {
        SocketAddr::new(self.client_addr, self.client_port)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn config_timeout(&self) -> Duration {
        Duration::from_millis(self.config_timeout_ms)
    }
}

/// Unresolved parameters; every field left `None` takes its default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParamsBuilder {
    pub inst_addr: Option<IpAddr>,
    pub inst_port: Option<u16>,
    pub client_addr: Option<IpAddr>,
    pub client_port: Option<u16>,
    pub recv_buf_size: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub reply_timeout_ms: Option<u64>,
    pub config_timeout_ms: Option<u64>,
    pub max_datagram_size: Option<usize>,
}

impl ParamsBuilder {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml_ng::from_str(yaml)
            .map_err(|e| SdkError::config(format!("invalid parameter document: {}", e)))
    }

    /// Builder seeded from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Override fields from `CBSDK_*` environment variables.
    pub fn with_env(self) -> Result<Self> {
        self.with_lookup(|name| std::env::var(name).ok())
    }

    /// Override fields from `lookup`, which maps variable names to values.
    pub fn with_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup(ENV_INST_ADDR) {
            self.inst_addr = Some(parse_var(ENV_INST_ADDR, &value)?);
        }
        if let Some(value) = lookup(ENV_INST_PORT) {
            self.inst_port = Some(parse_var(ENV_INST_PORT, &value)?);
        }
        if let Some(value) = lookup(ENV_CLIENT_ADDR) {
            self.client_addr = Some(parse_var(ENV_CLIENT_ADDR, &value)?);
        }
        if let Some(value) = lookup(ENV_CLIENT_PORT) {
            self.client_port = Some(parse_var(ENV_CLIENT_PORT, &value)?);
        }
        if let Some(value) = lookup(ENV_RECV_BUFSIZE) {
            self.recv_buf_size = Some(parse_var(ENV_RECV_BUFSIZE, &value)?);
        }
        Ok(self)
    }

    pub fn inst_addr(mut self, addr: IpAddr) -> Self {
        self.inst_addr = Some(addr);
        self
    }

    pub fn inst_port(mut self, port: u16) -> Self {
        self.inst_port = Some(port);
        self
    }

    pub fn client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    pub fn client_port(mut self, port: u16) -> Self {
        self.client_port = Some(port);
        self
    }

    pub fn recv_buf_size(mut self, size: usize) -> Self {
        self.recv_buf_size = Some(size);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn config_timeout(mut self, timeout: Duration) -> Self {
        self.config_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = Some(size);
        self
    }

    /// Resolve defaults and validate.
    pub fn build(self) -> Result<Params> {
        let client_addr = match self.client_addr {
            Some(addr) => addr,
            None => default_client_addr()?,
        };
        let inst_addr = self.inst_addr.unwrap_or(if client_addr.is_loopback() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(DEFAULT_INST_ADDR)
        });

        let params = Params {
            inst_addr,
            inst_port: self.inst_port.unwrap_or(DEFAULT_PORT),
            client_addr,
            client_port: self.client_port.unwrap_or(DEFAULT_PORT),
            recv_buf_size: self.recv_buf_size.unwrap_or(DEFAULT_RECV_BUF_SIZE),
            queue_capacity: self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            reply_timeout_ms: self.reply_timeout_ms.unwrap_or(450),
            config_timeout_ms: self.config_timeout_ms.unwrap_or(2000),
            max_datagram_size: self.max_datagram_size.unwrap_or(DEFAULT_MAX_DATAGRAM_SIZE),
        };

        if params.queue_capacity == 0 {
            return Err(SdkError::config("queue_capacity must be at least 1"));
        }
        if params.max_datagram_size < HEADER_SIZE {
            return Err(SdkError::config(format!(
                "max_datagram_size must hold at least one {}-byte header",
                HEADER_SIZE
            )));
        }
        if params.inst_port == 0 {
            return Err(SdkError::config("inst_port must be non-zero"));
        }

        debug!(local = %params.local(), remote = %params.remote(), "Parameters resolved");
        Ok(params)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SdkError::config(format!("{}={:?}: {}", name, value, e)))
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(target_os = "linux")]
fn default_client_addr() -> Result<IpAddr> {
    Ok(IpAddr::V4(LINUX_CLIENT_ADDR))
}

#[cfg(windows)]
fn default_client_addr() -> Result<IpAddr> {
    Err(SdkError::config(
        "client_addr is required on Windows; set it to the instrument-facing adapter address",
    ))
}

#[cfg(not(any(target_os = "linux", windows)))]
fn default_client_addr() -> Result<IpAddr> {
    Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Builder seeded from the environment, ready for explicit overrides.
pub fn create_params() -> Result<ParamsBuilder> {
    ParamsBuilder::from_env()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn loopback() -> ParamsBuilder {
        Params::builder().client_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn loopback_client_defaults_instrument_to_loopback() {
        let params = loopback().build().unwrap();
        assert_eq!(params.remote(), "127.0.0.1:51002".parse().unwrap());
        assert_eq!(params.local(), "127.0.0.1:51002".parse().unwrap());
        assert_eq!(params.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(params.reply_timeout(), Duration::from_millis(450));
        assert_eq!(params.config_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn remote_client_defaults_to_the_instrument_subnet() {
        let params =
            Params::builder().client_addr("192.168.137.1".parse().unwrap()).build().unwrap();
        assert_eq!(params.inst_addr, IpAddr::V4(DEFAULT_INST_ADDR));
    }

    #[test]
    fn yaml_then_env_then_setters() {
        let yaml = "client_addr: 127.0.0.1\ninst_port: 6000\nqueue_capacity: 128\n";
        let env: HashMap<&str, &str> =
            [("CBSDK_INST_PORT", "7000"), ("CBSDK_RECV_BUFSIZE", "1024")].into();

        let params = ParamsBuilder::from_yaml(yaml)
            .unwrap()
            .with_lookup(|name| env.get(name).map(|v| v.to_string()))
            .unwrap()
            .queue_capacity(256)
            .build()
            .unwrap();

        assert_eq!(params.inst_port, 7000);
        assert_eq!(params.recv_buf_size, 1024);
        assert_eq!(params.queue_capacity, 256);
        assert_eq!(params.client_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn bad_environment_value_is_a_config_error() {
        let err = Params::builder()
            .with_lookup(|name| (name == "CBSDK_CLIENT_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, SdkError::Config { .. }));
        assert!(err.to_string().contains("CBSDK_CLIENT_PORT"));
    }

    #[test]
    fn unknown_yaml_key_is_rejected() {
        assert!(matches!(Params::from_yaml("bogus: 1\n"), Err(SdkError::Config { .. })));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(loopback().queue_capacity(0).build().is_err());
        assert!(loopback().max_datagram_size(4).build().is_err());
    }
}
