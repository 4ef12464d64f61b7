//! Adapter configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::backoff::ReconnectConfig;
use crate::ensemble::{ConnectSettings, MAX_REQUEST_LEN};
use crate::error::{Result, StoreError};
use crate::path::{PathMapper, DEFAULT_MAX_PATH_LEN};

/// Endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:2181";

/// Largest payload accepted by default. ZooKeeper's `jute.maxbuffer` defaults
/// to 1 MiB for the whole request, so the data limit leaves room for the
/// path, ACL and framing.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1_000_000;

/// Bytes of a create or set request that are neither payload nor path.
pub const REQUEST_FRAMING: usize = 4096;

/// Largest `max_payload_size` the ensemble can honour with paths of up to
/// `max_path_len` bytes.
pub fn payload_ceiling(max_path_len: usize) -> usize {
    MAX_REQUEST_LEN
        .saturating_sub(max_path_len)
        .saturating_sub(REQUEST_FRAMING)
}

/// Configuration for a [`crate::ZkStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Ensemble members as `host:port`. Accepts a list or a comma-separated
    /// string when deserialized.
    #[serde(deserialize_with = "deserialize_endpoints")]
    pub endpoints: Vec<String>,
    /// Znode under which all objects live.
    pub root: String,
    /// Session timeout negotiated with the ensemble.
    pub session_timeout_ms: u64,
    /// How long `acquire()` waits for a connected session.
    pub connection_timeout_ms: u64,
    /// Deadline for a single znode round trip.
    pub operation_timeout_ms: u64,
    /// Maximum accepted payload in bytes.
    pub max_payload_size: usize,
    /// Maximum znode path length in bytes.
    pub max_path_len: usize,
    /// Digest auth user.
    pub username: Option<String>,
    /// Digest auth password.
    pub password: Option<String>,
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            root: "/".to_string(),
            session_timeout_ms: 10_000,
            connection_timeout_ms: 5_000,
            operation_timeout_ms: 5_000,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_path_len: DEFAULT_MAX_PATH_LEN,
            username: None,
            password: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

fn split_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn deserialize_endpoints<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Endpoints {
        Joined(String),
        List(Vec<String>),
    }

    Ok(match Endpoints::deserialize(deserializer)? {
        Endpoints::Joined(raw) => split_endpoints(&raw),
        Endpoints::List(list) => list
            .iter()
            .flat_map(|entry| split_endpoints(entry))
            .collect(),
    })
}

impl StoreConfig {
    /// A config pointing at the given comma-separated endpoint list.
    pub fn with_endpoints(endpoints: &str) -> Self {
        Self {
            endpoints: split_endpoints(endpoints),
            ..Self::default()
        }
    }

    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("{}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: StoreConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| StoreError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| StoreError::Config(e.to_string()))?
            }
            _ => {
                return Err(StoreError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from string options (`endpoint`, `root`, `username`,
    /// `password`, `session_timeout_ms`, `connection_timeout_ms`,
    /// `operation_timeout_ms`, `max_payload_size`). Unknown keys are ignored;
    /// empty values keep the default.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| map.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(v) = get("endpoint") {
            config.endpoints = split_endpoints(v);
        }
        if let Some(v) = get("root") {
            config.root = v.to_string();
        }
        if let Some(v) = get("username") {
            config.username = Some(v.to_string());
        }
        if let Some(v) = get("password") {
            config.password = Some(v.to_string());
        }
        if let Some(v) = get("session_timeout_ms") {
            config.session_timeout_ms = parse_number("session_timeout_ms", v)?;
        }
        if let Some(v) = get("connection_timeout_ms") {
            config.connection_timeout_ms = parse_number("connection_timeout_ms", v)?;
        }
        if let Some(v) = get("operation_timeout_ms") {
            config.operation_timeout_ms = parse_number("operation_timeout_ms", v)?;
        }
        if let Some(v) = get("max_payload_size") {
            config.max_payload_size = parse_number("max_payload_size", v)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks the config for values the adapter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(StoreError::Config("no ensemble endpoints".to_string()));
        }
        for endpoint in &self.endpoints {
            validate_endpoint(endpoint)?;
        }
        for (name, value) in [
            ("session_timeout_ms", self.session_timeout_ms),
            ("connection_timeout_ms", self.connection_timeout_ms),
            ("operation_timeout_ms", self.operation_timeout_ms),
        ] {
            if value == 0 {
                return Err(StoreError::Config(format!("{} must be positive", name)));
            }
        }
        if self.max_payload_size == 0 {
            return Err(StoreError::Config(
                "max_payload_size must be positive".to_string(),
            ));
        }
        let ceiling = payload_ceiling(self.max_path_len);
        if self.max_payload_size > ceiling {
            return Err(StoreError::Config(format!(
                "max_payload_size {} exceeds the ensemble limit of {} bytes",
                self.max_payload_size, ceiling
            )));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(StoreError::Config(
                "username and password must be set together".to_string(),
            ));
        }
        self.reconnect.validate()?;
        self.path_mapper()?;
        Ok(())
    }

    /// The path mapper described by `root` and `max_path_len`.
    pub fn path_mapper(&self) -> Result<PathMapper> {
        PathMapper::new(&self.root, self.max_path_len)
    }

    /// Session timeout as a `Duration`.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Connection timeout as a `Duration`.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Operation timeout as a `Duration`.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// `user:password` for digest auth, when configured.
    pub fn digest_auth(&self) -> Option<Vec<u8>> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some(format!("{}:{}", user, password).into_bytes()),
            _ => None,
        }
    }

    /// Settings handed to a [`crate::ensemble::Connector`].
    pub fn connect_settings(&self) -> ConnectSettings {
        ConnectSettings {
            endpoints: self.endpoints.clone(),
            session_timeout: self.session_timeout(),
            connection_timeout: self.connection_timeout(),
            digest_auth: self.digest_auth(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| StoreError::Config(format!("{}: not a number: {}", name, value)))
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| StoreError::Config(format!("endpoint '{}' is not host:port", endpoint)))?;
    if host.is_empty() {
        return Err(StoreError::Config(format!(
            "endpoint '{}' has no host",
            endpoint
        )));
    }
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(StoreError::Config(format!(
            "endpoint '{}' has an invalid port",
            endpoint
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = StoreConfig::default();
        assert_eq!(config.endpoints, vec!["127.0.0.1:2181"]);
        assert_eq!(config.root, "/");
        assert_eq!(config.session_timeout(), Duration::from_secs(10));
        assert_eq!(config.connection_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
        assert!(config.digest_auth().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_endpoints_splits_list() {
        let config = StoreConfig::with_endpoints("zk1:2181, zk2:2181,,zk3:2182");
        assert_eq!(config.endpoints, vec!["zk1:2181", "zk2:2181", "zk3:2182"]);
        assert_eq!(
            config.connect_settings().connect_string(),
            "zk1:2181,zk2:2181,zk3:2182"
        );
    }

    #[test]
    fn test_validate_rejects_bad_endpoints() {
        for raw in ["", "nohost", ":2181", "zk1:0", "zk1:port"] {
            let config = StoreConfig::with_endpoints(raw);
            assert!(config.validate().is_err(), "accepted {:?}", raw);
        }
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let config = StoreConfig {
            operation_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_validate_requires_user_and_password_together() {
        let config = StoreConfig {
            username: Some("alice".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StoreConfig {
            username: Some("alice".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.digest_auth().unwrap(), b"alice:secret".to_vec());
    }

    #[test]
    fn test_validate_caps_payload_at_ensemble_limit() {
        assert!(DEFAULT_MAX_PAYLOAD_SIZE <= payload_ceiling(DEFAULT_MAX_PATH_LEN));

        let config = StoreConfig {
            max_payload_size: 2_000_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));

        let ceiling = payload_ceiling(DEFAULT_MAX_PATH_LEN);
        let at_ceiling = StoreConfig {
            max_payload_size: ceiling,
            ..Default::default()
        };
        assert!(at_ceiling.validate().is_ok());
        let over = StoreConfig {
            max_payload_size: ceiling + 1,
            ..Default::default()
        };
        assert!(over.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_reserved_root() {
        let config = StoreConfig {
            root: "/zookeeper/quota".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_map() {
        let mut map = HashMap::new();
        map.insert("endpoint".to_string(), "zk1:2181,zk2:2181".to_string());
        map.insert("root".to_string(), "/apps/store".to_string());
        map.insert("operation_timeout_ms".to_string(), "750".to_string());
        map.insert("username".to_string(), "".to_string());

        let config = StoreConfig::from_map(&map).unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.root, "/apps/store");
        assert_eq!(config.operation_timeout(), Duration::from_millis(750));
        assert!(config.username.is_none());
    }

    #[test]
    fn test_from_map_rejects_non_numeric() {
        let mut map = HashMap::new();
        map.insert("session_timeout_ms".to_string(), "soon".to_string());
        assert!(StoreConfig::from_map(&map).is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
endpoints = "zk1:2181,zk2:2181,zk3:2181"
root = "/store"
session_timeout_ms = 4000

[reconnect]
initial_delay_ms = 10
max_delay_ms = 1000
max_attempts = 5
"#
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.endpoints.len(), 3);
        assert_eq!(config.root, "/store");
        assert_eq!(config.session_timeout_ms, 4000);
        assert_eq!(config.connection_timeout_ms, 5_000);
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.reconnect.initial_delay_ms, 10);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"endpoints": ["zk1:2181", "zk2:2181"], "max_payload_size": 4096}}"#
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.endpoints, vec!["zk1:2181", "zk2:2181"]);
        assert_eq!(config.max_payload_size, 4096);
        assert!(config.reconnect.max_attempts.is_none());
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            StoreConfig::from_file(file.path()),
            Err(StoreError::Config(_))
        ));
    }
}
