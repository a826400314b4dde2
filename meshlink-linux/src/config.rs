//! Load config from file and environment.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use meshlink_core::MeshConfig;
use serde::Deserialize;

use crate::discovery::BeaconSettings;

/// Daemon configuration. File: ~/.config/meshlink/config.toml or /etc/meshlink/config.toml.
/// Env overrides: MESHLINK_SERVICE_NAME, MESHLINK_LISTEN_PORT, MESHLINK_DISCOVERY_PORT,
/// MESHLINK_MULTICAST_GROUP.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Service name advertised and searched for (default "meshlink").
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Peer TCP listen port (default 0, chosen by the OS and advertised).
    #[serde(default)]
    pub listen_port: u16,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Discovery multicast group (default 239.255.60.61).
    #[serde(default = "default_multicast_group")]
    pub multicast_group: String,
    #[serde(default = "default_beacon_interval_secs")]
    pub beacon_interval_secs: u64,
    /// A peer silent for this long is reported lost.
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_service_name() -> String {
    "meshlink".to_string()
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_multicast_group() -> String {
    "239.255.60.61".to_string()
}
fn default_beacon_interval_secs() -> u64 {
    4
}
fn default_peer_timeout_secs() -> u64 {
    16
}
fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            listen_port: 0,
            discovery_port: default_discovery_port(),
            multicast_group: default_multicast_group(),
            beacon_interval_secs: default_beacon_interval_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Config {
    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig::new(SocketAddr::from(([0, 0, 0, 0], self.listen_port)))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }

    pub fn beacon_settings(&self) -> anyhow::Result<BeaconSettings> {
        let multicast_group: Ipv4Addr = self
            .multicast_group
            .parse()
            .with_context(|| format!("invalid multicast group {:?}", self.multicast_group))?;
        anyhow::ensure!(
            multicast_group.is_multicast(),
            "{multicast_group} is not a multicast address"
        );
        anyhow::ensure!(self.beacon_interval_secs > 0, "beacon_interval_secs must be positive");
        anyhow::ensure!(
            self.peer_timeout_secs > self.beacon_interval_secs,
            "peer_timeout_secs must exceed beacon_interval_secs"
        );
        Ok(BeaconSettings {
            discovery_port: self.discovery_port,
            multicast_group,
            beacon_interval: Duration::from_secs(self.beacon_interval_secs),
            peer_timeout: Duration::from_secs(self.peer_timeout_secs),
        })
    }
}

/// Load config: default, then config file, then env vars. An explicit path
/// must exist and parse; the default locations are optional.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_default_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("MESHLINK_SERVICE_NAME") {
        if !s.is_empty() {
            c.service_name = s;
        }
    }
    if let Some(p) = var("MESHLINK_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(p) = var("MESHLINK_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(g) = var("MESHLINK_MULTICAST_GROUP") {
        c.multicast_group = g;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshlink/config.toml"));
    out
}

fn load_default_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "Ignoring config file");
            None
        }
    }
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("service_name = \"lab\"\nlisten_port = 4000\n").unwrap();
        assert_eq!(c.service_name, "lab");
        assert_eq!(c.listen_port, 4000);
        assert_eq!(c.discovery_port, 45680);
        assert_eq!(c.peer_timeout_secs, 16);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("MESHLINK_SERVICE_NAME", "office"),
            ("MESHLINK_LISTEN_PORT", "5000"),
            ("MESHLINK_DISCOVERY_PORT", "not a port"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.service_name, "office");
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.discovery_port, 45680);
        assert_eq!(c.multicast_group, "239.255.60.61");
    }

    #[test]
    fn beacon_settings_validated() {
        let settings = Config::default().beacon_settings().unwrap();
        assert_eq!(settings.multicast_group, Ipv4Addr::new(239, 255, 60, 61));
        assert_eq!(settings.beacon_interval, Duration::from_secs(4));

        let c = Config {
            multicast_group: "10.0.0.1".into(),
            ..Config::default()
        };
        assert!(c.beacon_settings().is_err());

        let c = Config {
            peer_timeout_secs: 2,
            ..Config::default()
        };
        assert!(c.beacon_settings().is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(load(Some(Path::new("/nonexistent/meshlink.toml"))).is_err());
    }

    #[test]
    fn mesh_config_uses_listen_port() {
        let c = Config {
            listen_port: 4100,
            connect_timeout_secs: 2,
            ..Config::default()
        };
        let mesh = c.mesh_config();
        assert_eq!(mesh.bind_addr.port(), 4100);
        assert_eq!(mesh.connect_timeout, Duration::from_secs(2));
    }
}
