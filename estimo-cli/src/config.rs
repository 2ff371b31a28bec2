//! Settings for the `estimo` binary.
//!
//! Layering, lowest to highest: built-in defaults, `ESTIMO_*` environment
//! variables, command-line flags.

use std::path::PathBuf;

use estimo_collab::server::ServerConfig;

pub const ENV_SERVER_URL: &str = "ESTIMO_SERVER_URL";
pub const ENV_BIND_ADDR: &str = "ESTIMO_BIND_ADDR";
pub const ENV_PROFILE_DIR: &str = "ESTIMO_PROFILE_DIR";
pub const ENV_MAX_PEERS: &str = "ESTIMO_MAX_PEERS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Relay URL used by `join`
    pub server_url: String,
    /// Profile directory; every `join` sharing it shares one identity
    pub profile_dir: PathBuf,
    pub relay: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        let relay = ServerConfig::default();
        Self {
            server_url: format!("ws://{}", relay.bind_addr),
            profile_dir: default_profile_dir(),
            relay,
        }
    }
}

fn default_profile_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".estimo"),
        None => PathBuf::from(".estimo"),
    }
}

/// Apply `ESTIMO_*` overrides from the process environment.
pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

/// Apply overrides from any variable source. Blank values are ignored,
/// unparsable ones are logged and ignored.
pub fn apply_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let value = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    if let Some(url) = value(ENV_SERVER_URL) {
        config.server_url = url;
    }
    if let Some(addr) = value(ENV_BIND_ADDR) {
        config.relay.bind_addr = addr;
    }
    if let Some(dir) = value(ENV_PROFILE_DIR) {
        config.profile_dir = PathBuf::from(dir);
    }
    if let Some(raw) = value(ENV_MAX_PEERS) {
        match raw.parse::<usize>() {
            Ok(n) if n > 0 => config.relay.max_peers_per_room = n,
            Ok(_) => log::warn!("{ENV_MAX_PEERS} must be positive, ignoring"),
            Err(err) => log::warn!("invalid {ENV_MAX_PEERS}, ignoring: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with_vars(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let mut config = Config::default();
        apply_overrides(&mut config, |key| vars.get(key).cloned());
        config
    }

    #[test]
    fn test_defaults_point_at_local_relay() {
        let config = Config::default();
        assert_eq!(config.server_url, "ws://127.0.0.1:9090");
        assert_eq!(config.relay.bind_addr, "127.0.0.1:9090");
    }

    #[test]
    fn test_env_overrides() {
        let config = with_vars(&[
            (ENV_SERVER_URL, "ws://relay.example:80"),
            (ENV_BIND_ADDR, "0.0.0.0:80"),
            (ENV_PROFILE_DIR, "/tmp/estimo-profile"),
            (ENV_MAX_PEERS, " 12 "),
        ]);
        assert_eq!(config.server_url, "ws://relay.example:80");
        assert_eq!(config.relay.bind_addr, "0.0.0.0:80");
        assert_eq!(config.profile_dir, PathBuf::from("/tmp/estimo-profile"));
        assert_eq!(config.relay.max_peers_per_room, 12);
    }

    #[test]
    fn test_blank_and_invalid_values_ignored() {
        let config = with_vars(&[(ENV_SERVER_URL, "   "), (ENV_MAX_PEERS, "lots")]);
        assert_eq!(config, Config::default());

        let config = with_vars(&[(ENV_MAX_PEERS, "0")]);
        assert_eq!(config.relay.max_peers_per_room, ServerConfig::default().max_peers_per_room);
    }
}
