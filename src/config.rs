//! Serde definitions for the `nat64d.toml` config file.

use std::{net::Ipv4Addr, path::Path, time::Duration};

use nat64session::engine::EngineOptions;
use nat64session::session::Timeouts;
use nat64session::transport::{Ipv4Transport, Ipv6Transport, Protocol};

fn default_udp_timeout() -> u64 {
    300
}
fn default_icmp_timeout() -> u64 {
    60
}
fn default_tcp_est_timeout() -> u64 {
    2 * 60 * 60 + 4 * 60
}
fn default_tcp_trans_timeout() -> u64 {
    4 * 60
}
fn default_expirer_interval() -> u64 {
    1
}

/// A static binding to install at startup.
#[derive(Debug, serde::Deserialize)]
pub struct StaticBindingConfig {
    #[serde(rename = "Protocol")]
    pub protocol: Protocol,
    #[serde(rename = "V6")]
    pub v6: Ipv6Transport,
    #[serde(rename = "V4")]
    pub v4: Ipv4Transport,
}

/// Representation of the `nat64d.toml` config file.
#[derive(Debug, serde::Deserialize)]
pub struct Config {
    /// IPv4 addresses to seed the transport address pool with.
    #[serde(rename = "Pool")]
    pub pool: Vec<Ipv4Addr>,

    /// Static bindings to install before the demonstration runs.
    #[serde(rename = "StaticBindings", default = "Vec::new")]
    pub static_bindings: Vec<StaticBindingConfig>,

    #[serde(rename = "UdpTimeout", default = "default_udp_timeout")]
    pub udp_timeout: u64,
    #[serde(rename = "IcmpTimeout", default = "default_icmp_timeout")]
    pub icmp_timeout: u64,
    #[serde(rename = "TcpEstTimeout", default = "default_tcp_est_timeout")]
    pub tcp_est_timeout: u64,
    #[serde(rename = "TcpTransTimeout", default = "default_tcp_trans_timeout")]
    pub tcp_trans_timeout: u64,
    #[serde(rename = "ExpirerInterval", default = "default_expirer_interval")]
    pub expirer_interval: u64,
    #[serde(rename = "AddressDependentFiltering", default)]
    pub address_dependent_filtering: bool,
}

impl Config {
    /// Load the config from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let file_contents = std::fs::read_to_string(path)?;
        let deserializer = toml::Deserializer::new(&file_contents);

        match serde_path_to_error::deserialize(deserializer) {
            Ok(config) => Ok(config),
            // If there is a parsing error, display a reasonable error message
            Err(e) => {
                eprintln!("Failed to parse config file due to:\n {}\n at {}", e.inner().message(), e.path());
                std::process::exit(1);
            }
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            timeouts: Timeouts {
                udp: Duration::from_secs(self.udp_timeout),
                icmp: Duration::from_secs(self.icmp_timeout),
                tcp_established: Duration::from_secs(self.tcp_est_timeout),
                tcp_transitory: Duration::from_secs(self.tcp_trans_timeout),
            },
            expirer_interval: Duration::from_secs(self.expirer_interval),
            address_dependent_filtering: self.address_dependent_filtering,
        }
    }
}
