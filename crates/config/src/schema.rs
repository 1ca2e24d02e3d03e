//! Config schema types for the gateway, broker, pairing renderer and the
//! WhatsApp sidecar.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampuslineConfig {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub pairing: PairingConfig,
    pub sidecar: SidecarConfig,
}

/// Gateway server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8720,
        }
    }
}

/// Session broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Prepended to bare 10-digit numbers. Digits only.
    pub default_country_code: String,
    /// Appended to every normalized recipient address.
    pub address_suffix: String,
    /// How long `initialize` waits for a pairing code or ready event.
    pub init_timeout_secs: u64,
    /// Upper bound for the graceful logout during teardown.
    pub logout_timeout_secs: u64,
    /// Parent directory of the per-tenant credential stores. Defaults to
    /// `<data_dir>/auth`.
    pub auth_base_dir: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_country_code: "91".into(),
            address_suffix: "@c.us".into(),
            init_timeout_secs: 60,
            logout_timeout_secs: 10,
            auth_base_dir: None,
        }
    }
}

impl BrokerConfig {
    /// The configured credential base directory, or the default under the
    /// data directory.
    pub fn resolved_auth_base_dir(&self) -> PathBuf {
        self.auth_base_dir
            .clone()
            .unwrap_or_else(|| crate::loader::data_dir().join("auth"))
    }
}

/// Pairing image rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Pixels per QR module.
    pub module_px: u32,
    /// Quiet zone around the code, in modules.
    pub margin_modules: u32,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            module_px: 8,
            margin_modules: 4,
        }
    }
}

/// Node.js WhatsApp Web sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Sidecar source directory. Auto-detected when unset.
    pub dir: Option<PathBuf>,
    pub node_binary: String,
    /// Time the process must survive after spawn before it counts as started.
    pub startup_grace_ms: u64,
    /// WebSocket connection attempts before giving up (500ms apart).
    pub connect_retries: u32,
    /// How long a send waits for the sidecar's result.
    pub send_timeout_secs: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            dir: None,
            node_binary: "node".into(),
            startup_grace_ms: 500,
            connect_retries: 20,
            send_timeout_secs: 30,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: CampuslineConfig = toml::from_str("").unwrap();
        assert_eq!(config, CampuslineConfig::default());
        assert_eq!(config.broker.default_country_code, "91");
        assert_eq!(config.broker.address_suffix, "@c.us");
        assert_eq!(config.broker.init_timeout_secs, 60);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: CampuslineConfig = toml::from_str(
            r#"
            [broker]
            default_country_code = "44"

            [sidecar]
            connect_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.broker.default_country_code, "44");
        assert_eq!(config.broker.address_suffix, "@c.us");
        assert_eq!(config.sidecar.connect_retries, 5);
        assert_eq!(config.sidecar.node_binary, "node");
    }

    #[test]
    fn explicit_auth_dir_wins() {
        let config = BrokerConfig {
            auth_base_dir: Some(PathBuf::from("/srv/campusline/auth")),
            ..Default::default()
        };
        assert_eq!(
            config.resolved_auth_base_dir(),
            PathBuf::from("/srv/campusline/auth")
        );
    }
}
