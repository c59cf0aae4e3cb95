use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::{DEFAULT_MAX_BUFFERED_BYTES, GatewayOptions, ListenTarget};
use crate::retry::ReconnectPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// `host:port` or a `ws://` URL
    pub listen: String,
    /// Per-client outbound queue limit before the client is dropped
    pub max_buffered_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9001".to_string(),
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

impl GatewayConfig {
    /// Gateway options with a syntactically valid listen address. Names are
    /// resolved when the gateway binds.
    pub fn options(&self) -> Result<GatewayOptions> {
        ListenTarget::parse(&self.listen)?;
        Ok(GatewayOptions {
            listen: self.listen.clone(),
            max_buffered_bytes: self.max_buffered_bytes,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Relay base URL; the tunnel id is appended as a path segment
    pub relay_url: Option<String>,
    pub id: Option<String>,
    /// Local HTTP origin that proxied requests are forwarded to
    pub target: Option<String>,
    /// WebSocket ping interval, 0 or absent to disable
    pub keepalive_secs: Option<u64>,
    pub reconnect: ReconnectPolicy,
}

impl TunnelConfig {
    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl Config {
    /// `~/.tunnelmux/config.toml`
    pub fn default_path() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".tunnelmux").join("config.toml")
    }

    /// Load from `path`, or the default location. A missing file yields
    /// the defaults; a malformed one is an error.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path.unwrap_or_else(Self::default_path);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            Ok(config)
        } else {
            tracing::debug!(path = %config_path.display(), "no config file, using defaults");
            Ok(Config::default())
        }
    }

    /// Write as TOML, creating parent directories. Used by `config init`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.gateway.listen, "127.0.0.1:9001");
        assert_eq!(config.tunnel.reconnect, ReconnectPolicy::tunnel_default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[gateway]
listen = "0.0.0.0:7000"

[tunnel]
relay_url = "https://relay.example"
id = "dev"
keepalive_secs = 30

[tunnel.reconnect]
max_delay_ms = 5000
"#,
        )
        .unwrap();

        let config = Config::load(Some(path)).unwrap();
        assert_eq!(config.gateway.listen, "0.0.0.0:7000");
        assert_eq!(config.gateway.max_buffered_bytes, DEFAULT_MAX_BUFFERED_BYTES);
        assert_eq!(config.tunnel.id.as_deref(), Some("dev"));
        assert_eq!(config.tunnel.keepalive(), Some(Duration::from_secs(30)));
        assert_eq!(config.tunnel.reconnect.max_delay, Duration::from_millis(5000));
        assert_eq!(config.tunnel.reconnect.base_delay, Duration::from_millis(250));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[gateway\nlisten = 1").unwrap();
        assert!(Config::load(Some(path)).is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.tunnel.target = Some("http://127.0.0.1:3000".into());
        config.save(&path).unwrap();
        assert_eq!(Config::load(Some(path)).unwrap(), config);
    }

    #[test]
    fn gateway_options_check_listen_syntax() {
        let options = GatewayConfig::default().options().unwrap();
        assert_eq!(options.listen, "127.0.0.1:9001");
        let named = GatewayConfig {
            listen: "ws://localhost:9001".into(),
            ..Default::default()
        };
        assert_eq!(named.options().unwrap().listen, "ws://localhost:9001");
        assert!(GatewayConfig {
            listen: "nowhere".into(),
            ..Default::default()
        }
        .options()
        .is_err());
    }

    #[test]
    fn zero_keepalive_disables_pings() {
        let tunnel = TunnelConfig {
            keepalive_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(tunnel.keepalive(), None);
    }
}
