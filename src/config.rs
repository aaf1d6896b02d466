//! Server and client settings.
//!
//! The server reads an optional JSON file (legacy deployment key names are
//! accepted as aliases) and command-line flags override it.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::Role;
use crate::error::ConfigError;
use crate::relay::DEFAULT_RELAY_TIMEOUT;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub primary_addr: String,
    pub secondary_addr: String,
    pub role: Role,
    /// Primary: the secondary's relay listener. Secondary: where to listen.
    #[serde(alias = "pri2SecAddr", alias = "pri2SecHost")]
    pub relay_addr: Option<String>,
    /// Receive sockets per endpoint; 0 means one per CPU.
    #[serde(alias = "max_procs", alias = "maxProcs")]
    pub workers: usize,
    pub software: Option<String>,
    pub relay_timeout_ms: u64,
    #[serde(alias = "debug_level")]
    pub debug_level: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            primary_addr: "127.0.0.1:3478".to_string(),
            secondary_addr: String::new(),
            role: Role::Both,
            relay_addr: None,
            workers: 1,
            software: None,
            relay_timeout_ms: DEFAULT_RELAY_TIMEOUT.as_millis() as u64,
            debug_level: 0,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Rejects role/address combinations that cannot serve the grid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.primary_addr.trim().is_empty() {
            return Err(ConfigError::MissingAddress("primary"));
        }
        if self.secondary_addr.trim().is_empty() {
            return Err(ConfigError::MissingAddress("secondary"));
        }
        // A zero timeout fails every relay POST before it is sent.
        if self.relay_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "relay_timeout_ms",
                value: self.relay_timeout_ms.to_string(),
            });
        }
        let relay_missing = self
            .relay_addr
            .as_deref()
            .map_or(true, |r| r.trim().is_empty());
        match self.role {
            Role::Primary | Role::Secondary if relay_missing => {
                Err(ConfigError::MissingRelay(self.role.as_str()))
            }
            _ => Ok(()),
        }
    }

    pub fn worker_count(&self) -> usize {
        match self.workers {
            0 => num_cpus::get(),
            n => n,
        }
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }

    /// `tracing` level for `debug_level` 0, 1 and 2+.
    pub fn log_level(&self) -> &'static str {
        match self.debug_level {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// `host[:port]` of the primary endpoint.
    pub server: String,
    /// `host[:port]` on the server's other IP, used for the mapping test.
    pub alternate: Option<String>,
    /// Local bind address, `ip` or `ip:port`.
    pub local: String,
    pub timeout: Duration,
    pub retries: u32,
    /// Upper bound on the whole discovery.
    pub deadline: Option<Duration>,
    pub verbose: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server: "stun.sipgate.net:3478".to_string(),
            alternate: None,
            local: "0.0.0.0:0".to_string(),
            timeout: Duration::from_millis(500),
            retries: 3,
            deadline: None,
            verbose: false,
        }
    }
}

impl ClientConfig {
    /// The local address with a port, `:0` appended when none was given.
    pub fn local_bind(&self) -> String {
        let local = self.local.trim();
        if local.is_empty() {
            "0.0.0.0:0".to_string()
        } else if local.starts_with('[') {
            if local.contains("]:") {
                local.to_string()
            } else {
                format!("{local}:0")
            }
        } else if local.matches(':').count() == 1 {
            local.to_string()
        } else if local.contains(':') {
            format!("[{local}]:0")
        } else {
            format!("{local}:0")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_keys_are_accepted() {
        let cfg = ServerConfig::from_json(
            br#"{
                "max_procs": 4,
                "primaryAddr": "10.0.0.1:3478",
                "secondaryAddr": "10.0.0.2:3479",
                "pri2SecAddr": "10.0.0.2:8080",
                "role": "pri",
                "debug_level": 1
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.primary_addr, "10.0.0.1:3478");
        assert_eq!(cfg.secondary_addr, "10.0.0.2:3479");
        assert_eq!(cfg.relay_addr.as_deref(), Some("10.0.0.2:8080"));
        assert_eq!(cfg.role, Role::Primary);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.log_level(), "debug");
        assert_eq!(cfg.relay_timeout_ms, 3000);
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_role_fails_to_parse() {
        assert!(ServerConfig::from_json(br#"{"role": "tertiary"}"#).is_err());
    }

    #[test]
    fn split_roles_need_relay() {
        let mut cfg = ServerConfig {
            secondary_addr: "10.0.0.2:3479".into(),
            role: Role::Primary,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingRelay("primary"))));
        cfg.role = Role::Secondary;
        cfg.relay_addr = Some("  ".into());
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingRelay("secondary"))));
        cfg.role = Role::Both;
        cfg.validate().unwrap();
    }

    #[test]
    fn secondary_address_required() {
        let cfg = ServerConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingAddress("secondary"))));
    }

    #[test]
    fn zero_relay_timeout_is_rejected() {
        let cfg = ServerConfig::from_json(
            br#"{"secondaryAddr": "10.0.0.2:3479", "relayTimeoutMs": 0}"#,
        )
        .unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue {
                field: "relay_timeout_ms",
                ..
            })
        ));
    }

    #[test]
    fn zero_workers_means_all_cpus() {
        let cfg = ServerConfig {
            workers: 0,
            ..Default::default()
        };
        assert_eq!(cfg.worker_count(), num_cpus::get());
    }

    #[test]
    fn local_bind_forms() {
        let mut cfg = ClientConfig::default();
        assert_eq!(cfg.local_bind(), "0.0.0.0:0");
        cfg.local = "192.168.1.5".into();
        assert_eq!(cfg.local_bind(), "192.168.1.5:0");
        cfg.local = "192.168.1.5:4000".into();
        assert_eq!(cfg.local_bind(), "192.168.1.5:4000");
        cfg.local = "::".into();
        assert_eq!(cfg.local_bind(), "[::]:0");
        cfg.local = String::new();
        assert_eq!(cfg.local_bind(), "0.0.0.0:0");
    }
}
