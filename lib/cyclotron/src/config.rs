//! Client-side configuration: the `EPICS_CA_*` environment contract plus an
//! optional TOML file form.

use serde_derive::{Deserialize, Serialize};
use std::env;
use std::path::Path;

pub const DEFAULT_SERVER_PORT: u16 = 5064;
pub const DEFAULT_REPEATER_PORT: u16 = 5065;
pub const DEFAULT_MAX_ARRAY_BYTES: usize = 16384;

/// A resolved search destination. An explicit port in the address list also
/// implies repeater registration for that entry.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SearchTarget {
    pub host: String,
    pub port: u16,
    pub explicit_port: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub address_list: Vec<String>,
    pub auto_address_list: bool,
    pub repeater_port: u16,
    pub server_port: u16,
    /// Maximum permitted payload in a single response.
    pub max_array_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            address_list: Vec::new(),
            auto_address_list: true,
            repeater_port: DEFAULT_REPEATER_PORT,
            server_port: DEFAULT_SERVER_PORT,
            max_array_bytes: DEFAULT_MAX_ARRAY_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ClientConfig {
        serdeconv::from_toml_file(path).expect("Error loading channel access configuration file")
    }

    /// Builds a configuration from the `EPICS_CA_*` environment, falling back
    /// to the defaults for anything unset or unparseable.
    pub fn from_env() -> ClientConfig {
        let mut config = ClientConfig::default();

        if let Ok(list) = env::var("EPICS_CA_ADDR_LIST") {
            config.address_list = list.split_whitespace().map(str::to_string).collect();
        }

        if let Ok(flag) = env::var("EPICS_CA_AUTO_ADDR_LIST") {
            config.auto_address_list = !flag.eq_ignore_ascii_case("no");
        }

        if let Some(port) = parse_env("EPICS_CA_REPEATER_PORT") {
            config.repeater_port = port;
        }

        if let Some(port) = parse_env("EPICS_CA_SERVER_PORT") {
            config.server_port = port;
        }

        if let Some(bytes) = parse_env("EPICS_CA_MAX_ARRAY_BYTES") {
            config.max_array_bytes = bytes;
        }

        config
    }

    /// Resolves the address list into (host, port) search destinations.
    pub fn search_targets(&self) -> Vec<SearchTarget> {
        self.address_list
            .iter()
            .map(|entry| match entry.rfind(':') {
                Some(split) => {
                    let (host, port_text) = entry.split_at(split);
                    match port_text[1..].parse::<u16>() {
                        Ok(port) => SearchTarget { host: host.to_string(), port, explicit_port: true },
                        Err(_) => SearchTarget { host: entry.clone(), port: self.server_port, explicit_port: false },
                    }
                }
                None => SearchTarget { host: entry.clone(), port: self.server_port, explicit_port: false },
            })
            .collect()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}
