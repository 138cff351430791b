use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("IO error: {0}")]
  IO(#[from] std::io::Error),
  #[error("Parse error: {0}")]
  Parse(#[from] serde_yaml::Error),
  #[error("Validation error: {0}")]
  Invalid(String),
}

const DEFAULT_CONFIG_YAML: &str = include_str!("default_config.yaml");

/// Minimum allowed gap between two reports for the same ip.
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
  pub ssh: Ssh,
  #[serde(default)]
  pub http: Http,
  #[serde(default)]
  pub ftp: Ftp,
  pub database: Database,
  #[serde(default)]
  pub dashboard: Dashboard,
  #[serde(default)]
  pub abuseipdb: Abuseipdb,
  #[serde(default)]
  pub log: Log,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Ssh {
  pub address: String,
  #[serde(with = "humantime_serde", default = "default_delay")]
  pub delay: Duration,
  #[serde(default)]
  pub key_seed: String,
  /// Version string presented to clients, without the "SSH-2.0-" prefix.
  #[serde(default = "default_ssh_banner")]
  pub banner: String,
}

impl Default for Ssh {
  fn default() -> Self {
    return Ssh {
      address: String::new(),
      delay: default_delay(),
      key_seed: String::new(),
      banner: default_ssh_banner(),
    };
  }
}

fn default_delay() -> Duration {
  return Duration::from_secs(2);
}

fn default_ssh_banner() -> String {
  return "OpenSSH_8.0".to_string();
}

impl Ssh {
  fn validate(&self) -> Result<(), ConfigError> {
    if self.address.is_empty() {
      return Err(ConfigError::Invalid("ssh.address is required".into()));
    }
    return Ok(());
  }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Http {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub address: String,
}

impl Http {
  fn validate(&self) -> Result<(), ConfigError> {
    if self.enabled && self.address.is_empty() {
      return Err(ConfigError::Invalid("http.address is required".into()));
    }
    return Ok(());
  }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Ftp {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub address: String,
}

impl Ftp {
  fn validate(&self) -> Result<(), ConfigError> {
    if self.enabled && self.address.is_empty() {
      return Err(ConfigError::Invalid("ftp.address is required".into()));
    }
    return Ok(());
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
  #[default]
  Sqlite,
  Postgres,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Database {
  #[serde(default)]
  pub driver: Driver,
  pub dsn: String,
}

impl Database {
  fn validate(&self) -> Result<(), ConfigError> {
    if self.dsn.is_empty() {
      return Err(ConfigError::Invalid("database.dsn is required".into()));
    }
    return Ok(());
  }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Dashboard {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub username: String,
  #[serde(default)]
  pub password: String,
}

impl Dashboard {
  fn validate(&self) -> Result<(), ConfigError> {
    if !self.enabled {
      return Ok(());
    }
    if self.username.is_empty() {
      return Err(ConfigError::Invalid("dashboard.username is required".into()));
    }
    if self.password.len() < 8 {
      return Err(ConfigError::Invalid(
        "dashboard.password is required and must be at least 8 characters".into(),
      ));
    }
    return Ok(());
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Abuseipdb {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub key: String,
  #[serde(with = "humantime_serde", default = "default_report_interval")]
  pub interval: Duration,
}

impl Default for Abuseipdb {
  fn default() -> Self {
    return Abuseipdb {
      enabled: false,
      key: String::new(),
      interval: default_report_interval(),
    };
  }
}

fn default_report_interval() -> Duration {
  return Duration::from_secs(20 * 60);
}

impl Abuseipdb {
  fn validate(&self) -> Result<(), ConfigError> {
    if !self.enabled {
      return Ok(());
    }
    if self.key.is_empty() {
      return Err(ConfigError::Invalid(
        "abuseipdb.key is required when enabled".into(),
      ));
    }
    if self.interval < MIN_REPORT_INTERVAL {
      return Err(ConfigError::Invalid(format!(
        "abuseipdb.interval must be at least {}s",
        MIN_REPORT_INTERVAL.as_secs()
      )));
    }
    return Ok(());
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Log {
  #[serde(default = "default_log_level")]
  pub level: String,
}

impl Default for Log {
  fn default() -> Self {
    return Log {
      level: default_log_level(),
    };
  }
}

fn default_log_level() -> String {
  return "info".to_string();
}

impl Log {
  fn validate(&self) -> Result<(), ConfigError> {
    match self.level.to_ascii_lowercase().as_str() {
      "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
      level => Err(ConfigError::Invalid(format!(
        "log.level {level:?} is not one of trace, debug, info, warn, error"
      ))),
    }
  }
}

impl Config {
  /// Load and validate the config at `path`. When the file is absent and `generate` is set, a
  /// default config is written there first.
  pub fn load(path: impl AsRef<Path>, generate: bool) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    if !path.exists() && generate {
      Self::generate(path)?;
    }

    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.validate()?;
    return Ok(config);
  }

  /// Write the embedded default config to `path`, creating parent directories.
  pub fn generate(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let path = path.as_ref();
    if let Some(dir) = path.parent() {
      if !dir.as_os_str().is_empty() {
        std::fs::create_dir_all(dir)?;
      }
    }
    std::fs::write(path, DEFAULT_CONFIG_YAML)?;
    info!(path = %path.display(), "generated default config");
    return Ok(());
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    self.ssh.validate()?;
    self.http.validate()?;
    self.ftp.validate()?;
    self.database.validate()?;
    self.dashboard.validate()?;
    self.abuseipdb.validate()?;
    self.log.validate()?;

    if self.dashboard.enabled && !self.http.enabled {
      return Err(ConfigError::Invalid(
        "http.enabled must be true when dashboard.enabled is true".into(),
      ));
    }

    return Ok(());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn load_default_config() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");

    let config = Config::load(&path, true).unwrap();
    assert!(path.exists());
    assert_eq!(config.ssh.delay, Duration::from_secs(2));
    assert_eq!(config.database.driver, Driver::Sqlite);
    assert_eq!(config.abuseipdb.interval, Duration::from_secs(20 * 60));
    assert_eq!(config.log.level, "info");
  }

  #[test]
  fn missing_config_without_generate() {
    let dir = tempfile::TempDir::new().unwrap();
    assert!(Config::load(dir.path().join("config.yaml"), false).is_err());
  }

  fn base_config() -> Config {
    return Config {
      ssh: Ssh {
        address: "0.0.0.0:2222".into(),
        ..Default::default()
      },
      database: Database {
        driver: Driver::Sqlite,
        dsn: "funeypot.db".into(),
      },
      ..Default::default()
    };
  }

  #[test]
  fn dashboard_requires_http() {
    let mut config = base_config();
    config.dashboard = Dashboard {
      enabled: true,
      username: "admin".into(),
      password: "longenough".into(),
    };
    assert!(config.validate().is_err());

    config.http = Http {
      enabled: true,
      address: "0.0.0.0:8080".into(),
    };
    config.validate().unwrap();

    config.dashboard.password = "short".into();
    assert!(config.validate().is_err());
  }

  #[test]
  fn abuseipdb_interval_floor() {
    let mut config = base_config();
    config.abuseipdb = Abuseipdb {
      enabled: true,
      key: "test_key".into(),
      interval: Duration::from_secs(10 * 60),
    };
    assert!(config.validate().is_err());

    config.abuseipdb.interval = Duration::from_secs(15 * 60);
    config.validate().unwrap();
  }

  #[test]
  fn parses_durations() {
    let config: Config = serde_yaml::from_str(
      r#"
ssh:
  address: "0.0.0.0:2222"
  delay: "500ms"
database:
  driver: "postgres"
  dsn: "postgres://localhost/funeypot"
abuseipdb:
  enabled: true
  key: "k"
  interval: "30m"
"#,
    )
    .unwrap();
    assert_eq!(config.ssh.delay, Duration::from_millis(500));
    assert_eq!(config.database.driver, Driver::Postgres);
    assert_eq!(config.abuseipdb.interval, Duration::from_secs(30 * 60));
  }
}
