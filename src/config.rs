//! Profile store and server configuration
//!
//! Profiles are clamped on insertion, versioned by a global monotonic
//! counter, and read under a shared lock so the data plane never blocks
//! behind a control write for long. Mutations are rate-limited to
//! protect the store from a runaway operator script.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::types::{AnomalyProfile, ConfigLimits, DirectionalProfile, ServerConfig};

/// Thread-safe profile store plus the immutable server config
pub struct ConfigManager {
    server_config: ServerConfig,
    profiles: RwLock<HashMap<String, AnomalyProfile>>,
    next_version: AtomicU32,
    rate: Mutex<RateWindow>,
}

struct RateWindow {
    window_start: Instant,
    count: u32,
}

impl ConfigManager {
    pub fn new(server_config: ServerConfig) -> Self {
        Self {
            server_config,
            profiles: RwLock::new(HashMap::new()),
            next_version: AtomicU32::new(1),
            rate: Mutex::new(RateWindow {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.server_config
    }

    /// Profile by name; a missing name is the zero profile (no faults)
    pub fn get_profile(&self, name: &str) -> AnomalyProfile {
        self.profiles
            .read()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Clamp, version and store a profile; returns the new version
    pub fn set_profile(&self, name: &str, mut profile: AnomalyProfile) -> u32 {
        profile.client_to_server = validate(&profile.client_to_server);
        profile.server_to_client = validate(&profile.server_to_client);
        profile.version = self.next_version.fetch_add(1, Ordering::Relaxed);

        self.profiles
            .write()
            .unwrap()
            .insert(name.to_string(), profile);
        profile.version
    }

    /// Remove a profile; false if it did not exist
    pub fn delete_profile(&self, name: &str) -> bool {
        self.profiles.write().unwrap().remove(name).is_some()
    }

    /// Admit a mutation under the 10-per-second tumbling window
    pub fn check_rate_limit(&self) -> bool {
        let mut rate = self.rate.lock().unwrap();
        let now = Instant::now();

        if now.duration_since(rate.window_start) >= Duration::from_secs(1) {
            rate.window_start = now;
            rate.count = 1;
            return true;
        }
        if rate.count >= ConfigLimits::CONFIG_UPDATE_RATE_LIMIT {
            return false;
        }
        rate.count += 1;
        true
    }
}

/// Clamp every knob of one direction to [`ConfigLimits`]
pub fn validate(profile: &DirectionalProfile) -> DirectionalProfile {
    DirectionalProfile {
        latency_ms: profile.latency_ms.min(ConfigLimits::MAX_LATENCY_MS),
        jitter_ms: profile.jitter_ms.min(ConfigLimits::MAX_JITTER_MS),
        throttle_kbps: profile.throttle_kbps.min(ConfigLimits::MAX_THROTTLE_KBPS),
        drop_rate: profile.drop_rate.clamp(0.0, ConfigLimits::MAX_RATE),
        stall_probability: profile.stall_probability.clamp(0.0, ConfigLimits::MAX_RATE),
        corrupt_rate: profile.corrupt_rate.clamp(0.0, ConfigLimits::MAX_RATE),
        reorder_rate: profile.reorder_rate.clamp(0.0, ConfigLimits::MAX_RATE),
        half_close_rate: profile.half_close_rate.clamp(0.0, ConfigLimits::MAX_RATE),
    }
}

/// Overlay settings from a TOML file onto `config`
///
/// Recognized keys: `listen`, `upstream` (host:port), `control_port`,
/// `seed`, and the `*_timeout_ms` / `*_linger_ms` durations. Unknown keys
/// are ignored; CLI flags applied afterwards win.
pub fn load_config_file(config: &mut ServerConfig, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let value: toml::Value = content
        .parse()
        .with_context(|| format!("parsing config file {}", path.display()))?;

    if let Some(listen) = value.get("listen").and_then(|v| v.as_str()) {
        let (host, port) = split_host_port(listen, config.listen_port)?;
        config.listen_host = host;
        config.listen_port = port;
    }
    if let Some(upstream) = value.get("upstream").and_then(|v| v.as_str()) {
        let (host, port) = split_host_port(upstream, config.upstream_port)?;
        config.upstream_host = host;
        config.upstream_port = port;
    }
    if let Some(port) = value.get("control_port").and_then(|v| v.as_integer()) {
        config.control_port = port as u16;
    }
    if let Some(seed) = value.get("seed").and_then(|v| v.as_integer()) {
        config.global_seed = seed as u64;
    }

    let duration = |key: &str, target: &mut Duration| {
        if let Some(ms) = value.get(key).and_then(|v| v.as_integer()) {
            *target = Duration::from_millis(ms as u64);
        }
    };
    duration("connect_timeout_ms", &mut config.connect_timeout);
    duration("idle_timeout_ms", &mut config.idle_timeout);
    duration("stall_timeout_ms", &mut config.stall_timeout);
    duration("min_linger_ms", &mut config.min_linger);
    duration("max_linger_ms", &mut config.max_linger);

    Ok(())
}

/// Parse "host:port" or a bare port, keeping the previous host
pub fn split_host_port(arg: &str, default_port: u16) -> Result<(String, u16)> {
    match arg.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().with_context(|| format!("invalid port in {arg:?}"))?;
            Ok((host.to_string(), port))
        }
        None => {
            if let Ok(port) = arg.parse::<u16>() {
                Ok(("0.0.0.0".to_string(), port))
            } else {
                Ok((arg.to_string(), default_port))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_profile_is_zero() {
        let cfg = ConfigManager::new(ServerConfig::default());
        let p = cfg.get_profile("nope");
        assert_eq!(p, AnomalyProfile::default());
        assert_eq!(p.version, 0);
    }

    #[test]
    fn test_set_then_get_returns_assigned_version() {
        let cfg = ConfigManager::new(ServerConfig::default());
        let v1 = cfg.set_profile("default", AnomalyProfile::default());
        assert_eq!(v1, 1);
        assert_eq!(cfg.get_profile("default").version, 1);

        let v2 = cfg.set_profile("chaos", AnomalyProfile::default());
        let v3 = cfg.set_profile("default", AnomalyProfile::default());
        assert!(v1 < v2 && v2 < v3);
        assert_eq!(cfg.get_profile("default").version, v3);
    }

    #[test]
    fn test_profiles_are_clamped_silently() {
        let cfg = ConfigManager::new(ServerConfig::default());
        let mut profile = AnomalyProfile::default();
        profile.client_to_server.latency_ms = 999_999;
        profile.client_to_server.drop_rate = 7.5;
        profile.server_to_client.corrupt_rate = -1.0;

        cfg.set_profile("wild", profile);
        let stored = cfg.get_profile("wild");
        assert_eq!(stored.client_to_server.latency_ms, ConfigLimits::MAX_LATENCY_MS);
        assert_eq!(stored.client_to_server.drop_rate, 1.0);
        assert_eq!(stored.server_to_client.corrupt_rate, 0.0);
    }

    #[test]
    fn test_delete_profile() {
        let cfg = ConfigManager::new(ServerConfig::default());
        cfg.set_profile("gone", AnomalyProfile::default());
        assert!(cfg.delete_profile("gone"));
        assert!(!cfg.delete_profile("gone"));
        assert_eq!(cfg.get_profile("gone").version, 0);
    }

    #[test]
    fn test_rate_limit_window() {
        let cfg = ConfigManager::new(ServerConfig::default());
        for _ in 0..ConfigLimits::CONFIG_UPDATE_RATE_LIMIT {
            assert!(cfg.check_rate_limit());
        }
        assert!(!cfg.check_rate_limit());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("0.0.0.0:8080", 1).unwrap(),
            ("0.0.0.0".to_string(), 8080)
        );
        assert_eq!(split_host_port("9000", 1).unwrap(), ("0.0.0.0".to_string(), 9000));
        assert!(split_host_port("host:notaport", 1).is_err());
    }
}
