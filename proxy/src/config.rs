//! Proxy configuration: JSON or YAML, with the same defaulting and
//! validation passes the deployment has always relied on.

use serde::Deserialize;
use sharder::HashKey;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Reported in the `X-Influxdb-Version` response header.
pub const VERSION: &str = "2.5.5";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid yaml config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("circles cannot be empty")]
    EmptyCircles,

    #[error("backends cannot be empty")]
    EmptyBackends,

    #[error("backend name cannot be empty")]
    EmptyBackendName,

    #[error("backend name duplicated: {0}")]
    DuplicatedBackendName(String),
}

/// One remote datastore instance.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth_secure: bool,
}

/// One replica group.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CircleConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub db: String,
    #[serde(default)]
    pub precision: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub circles: Vec<CircleConfig>,
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub db_list: Vec<String>,
    #[serde(default)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub hash_key: HashKey,
    #[serde(default)]
    pub flush_size: usize,
    #[serde(default)]
    pub flush_time: u64,
    #[serde(default)]
    pub check_interval: u64,
    #[serde(default)]
    pub rewrite_interval: u64,
    #[serde(default)]
    pub conn_pool_size: usize,
    #[serde(default)]
    pub write_timeout: u64,
    #[serde(default)]
    pub idle_timeout: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth_secure: bool,
    #[serde(default)]
    pub write_tracing: bool,
    #[serde(default)]
    pub query_tracing: bool,
    #[serde(default)]
    pub https_enabled: bool,
    #[serde(default)]
    pub https_cert: String,
    #[serde(default)]
    pub https_key: String,
    #[serde(default)]
    pub udp_enable: bool,
    #[serde(default)]
    pub udp_bind: String,
    #[serde(default)]
    pub udp_database: String,
    #[serde(default)]
    pub udp_pool_size: usize,
    #[serde(default)]
    pub udp_precision: String,
    #[serde(default)]
    pub mqtt_enable: bool,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
}

impl ProxyConfig {
    /// Load a config file; `.json` parses as JSON, everything else as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let mut cfg: Self = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&raw)?
        } else {
            serde_yaml::from_str(&raw)?
        };
        cfg.set_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn set_defaults(&mut self) {
        if self.listen_addr.is_empty() {
            self.listen_addr = ":80".to_string();
        }
        if self.data_dir.as_os_str().is_empty() {
            self.data_dir = PathBuf::from("data");
        }
        if self.flush_size == 0 {
            self.flush_size = 10_000;
        }
        if self.flush_time == 0 {
            self.flush_time = 1;
        }
        if self.check_interval == 0 {
            self.check_interval = 1;
        }
        if self.rewrite_interval == 0 {
            self.rewrite_interval = 10;
        }
        if self.conn_pool_size == 0 {
            self.conn_pool_size = 20;
        }
        if self.write_timeout == 0 {
            self.write_timeout = 10;
        }
        if self.idle_timeout == 0 {
            self.idle_timeout = 10;
        }
        if self.udp_pool_size == 0 {
            self.udp_pool_size = 16;
        }
        if self.udp_precision.is_empty() {
            self.udp_precision = "ns".to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circles.is_empty() {
            return Err(ConfigError::EmptyCircles);
        }
        let mut seen = std::collections::HashSet::new();
        for circle in &self.circles {
            if circle.backends.is_empty() {
                return Err(ConfigError::EmptyBackends);
            }
            for backend in &circle.backends {
                if backend.name.is_empty() {
                    return Err(ConfigError::EmptyBackendName);
                }
                if !seen.insert(backend.name.clone()) {
                    return Err(ConfigError::DuplicatedBackendName(backend.name.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn flush_time(&self) -> Duration {
        Duration::from_secs(self.flush_time)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn rewrite_interval(&self) -> Duration {
        Duration::from_secs(self.rewrite_interval)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> ProxyConfig {
        let yaml = r#"
circles:
  - name: c0
    backends:
      - name: b0
        url: http://127.0.0.1:8086
"#;
        let mut cfg: ProxyConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.set_defaults();
        cfg
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = minimal();
        assert_eq!(cfg.listen_addr, ":80");
        assert_eq!(cfg.data_dir, PathBuf::from("data"));
        assert_eq!(cfg.hash_key, HashKey::Idx);
        assert_eq!(cfg.flush_size, 10_000);
        assert_eq!(cfg.flush_time(), Duration::from_secs(1));
        assert_eq!(cfg.check_interval(), Duration::from_secs(1));
        assert_eq!(cfg.rewrite_interval(), Duration::from_secs(10));
        assert_eq!(cfg.conn_pool_size, 20);
        assert_eq!(cfg.write_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn validation_rejects_broken_topologies() {
        let mut cfg = minimal();
        cfg.circles.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyCircles)));

        let mut cfg = minimal();
        cfg.circles[0].backends.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyBackends)));

        let mut cfg = minimal();
        cfg.circles[0].backends[0].name.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyBackendName)));

        let mut cfg = minimal();
        let dup = cfg.circles[0].backends[0].clone();
        cfg.circles[0].backends.push(dup);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicatedBackendName(_))
        ));
    }

    #[test]
    fn json_and_yaml_both_load() {
        let dir = tempfile::tempdir().unwrap();

        let yaml_path = dir.path().join("proxy.yaml");
        std::fs::write(
            &yaml_path,
            "circles:\n  - backends:\n      - name: b0\n        url: http://h:8086\nhash_key: name\n",
        )
        .unwrap();
        let cfg = ProxyConfig::from_path(&yaml_path).unwrap();
        assert_eq!(cfg.hash_key, HashKey::Name);

        let json_path = dir.path().join("proxy.json");
        std::fs::write(
            &json_path,
            r#"{"circles":[{"backends":[{"name":"b0","url":"http://h:8086"}]}],"flush_size":3}"#,
        )
        .unwrap();
        let cfg = ProxyConfig::from_path(&json_path).unwrap();
        assert_eq!(cfg.flush_size, 3);
    }
}
