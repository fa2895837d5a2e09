use std::{env, fmt, fs, io, path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalogue::{HostEntry, ServiceDefinition};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config: {0}")]
    ReadFailed(#[source] io::Error),
    #[error("failed to write config: {0}")]
    WriteFailed(#[source] io::Error),
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config directory: neither XDG_CONFIG_HOME nor HOME is set")]
    ConfigPathUnavailable,
}

/// How hostnames turn into addresses before a test connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DnsStrategy {
    /// Resolve the name; fall back to the configured IP when that fails.
    Standard,
    /// Never resolve; use the configured IP.
    Ip,
    /// Resolve the name; a failed lookup fails the test.
    Only,
}

/// Whether helper processes draw from the socket concurrency ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPolicy {
    Separate,
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub collector: Collector,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub helpers: Helpers,
    #[serde(default)]
    pub escalation: Escalation,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Collector {
    pub address: String,
    pub port: u16,
    /// Messages per combo envelope.
    pub batch_size: usize,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Engine {
    pub store_path: path::PathBuf,
    pub timeout_seconds: u64,
    pub concurrency: usize,
    pub max_helpers: usize,
    pub budget: BudgetPolicy,
    pub dns: DnsStrategy,
    pub default_interval_seconds: u64,
    /// Reactor tick; stall-kill and schedule checks run at this cadence.
    pub tick_millis: u64,
    pub location: Option<String>,
    pub test_untagged: bool,
    pub ping_enabled: bool,
    pub ping_column: String,
    pub content_column: String,
    pub ssl_column: Option<String>,
    pub report_column: Option<String>,
    /// Reject TLS services whose certificate chain does not verify.
    pub verify_certificates: bool,
    /// The TLS column turns yellow with fewer days left on the certificate.
    pub sslwarn_days: u32,
    /// The TLS column turns red with fewer days left on the certificate.
    pub sslalarm_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Helpers {
    pub ping4: Vec<String>,
    pub ping6: Vec<String>,
    pub ping_timeout_seconds: u64,
    pub ping_batch_size: usize,
    pub ldap: Vec<String>,
    pub ldap_timeout_seconds: u64,
    pub external_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Escalation {
    /// Columns that never page: critical is reported as degraded.
    pub nopage: Vec<String>,
    /// Default `c:y:r` thresholds for the ping column.
    pub badconn: Option<String>,
}

impl Default for Collector {
    fn default() -> Self {
        Self { address: "127.0.0.1".into(), port: 1984, batch_size: 100, timeout_seconds: 15 }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            store_path: path::PathBuf::from("netprobe.db"),
            timeout_seconds: 10,
            concurrency: 256,
            max_helpers: 5,
            budget: BudgetPolicy::Separate,
            dns: DnsStrategy::Standard,
            default_interval_seconds: 300,
            tick_millis: 100,
            location: None,
            test_untagged: false,
            ping_enabled: true,
            ping_column: "conn".into(),
            content_column: "content".into(),
            ssl_column: Some("sslcert".into()),
            report_column: None,
            verify_certificates: false,
            sslwarn_days: 30,
            sslalarm_days: 10,
        }
    }
}

impl Default for Helpers {
    fn default() -> Self {
        let words = |words: &[&str]| words.iter().map(|word| word.to_string()).collect();
        Self {
            ping4: words(&["fping", "-4", "-C3", "-q"]),
            ping6: words(&["fping", "-6", "-C3", "-q"]),
            ping_timeout_seconds: 200,
            ping_batch_size: 500,
            ldap: words(&["ldapsearch", "-x", "-H", "%URL", "-b", "%BASE", "-s", "base", "-l", "%TIMEOUT"]),
            ldap_timeout_seconds: 30,
            external_timeout_seconds: 30,
        }
    }
}

impl Default for Escalation {
    fn default() -> Self {
        Self { nopage: Vec::new(), badconn: None }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            collector: Collector::default(),
            engine: Engine::default(),
            helpers: Helpers::default(),
            escalation: Escalation::default(),
            services: Vec::new(),
            hosts: Vec::new(),
        }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/netprobe/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, Error> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(Error::ConfigPathUnavailable);
    };

    Ok(path.join("netprobe/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);
        let or_none = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".into());

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Collector")?;
        write_1(f, "Address", &format!("{}:{}", self.collector.address, self.collector.port))?;
        write_1(f, "Batch Size", &self.collector.batch_size)?;
        write_title_1(f, "Engine")?;
        write_1(f, "Store", &self.engine.store_path.display())?;
        write_1(f, "Location", &or_none(&self.engine.location))?;
        write_1(f, "Timeout (s)", &self.engine.timeout_seconds)?;
        write_1(f, "Concurrency", &self.engine.concurrency)?;
        write_1(f, "Helper Processes", &self.engine.max_helpers)?;
        write_1(f, "Budget", &format!("{:?}", self.engine.budget))?;
        write_1(f, "DNS Strategy", &format!("{:?}", self.engine.dns))?;
        write_1(f, "Ping Column", &if self.engine.ping_enabled { self.engine.ping_column.clone() } else { "-".into() })?;
        write_1(f, "SSL Column", &or_none(&self.engine.ssl_column))?;
        write_1(f, "Report Column", &or_none(&self.engine.report_column))?;
        write_1(f, "Verify Certificates", &self.engine.verify_certificates)?;
        write_1(f, "Certificate Expiry (days)", &format!("{}/{}", self.engine.sslwarn_days, self.engine.sslalarm_days))?;
        write_title_1(f, "Catalogue")?;
        write_1(f, "Hosts", &self.hosts.len())?;
        write_1(f, "Service Overrides", &self.services.len())?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/netprobe/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, Error> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path).map_err(Error::ReadFailed)?;
            Ok(toml::from_str(raw_string.as_str())?)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), Error> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Error::WriteFailed)?;
        }

        fs::write(path, config_str).map_err(Error::WriteFailed)
    }

    /// Clamp the socket ceiling to what the open-file limit allows.
    pub fn effective_concurrency(&self) -> usize {
        let requested = self.engine.concurrency.max(1);
        match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
            Ok((soft, _)) if soft > 20 => requested.min((soft - 20) as usize),
            _ => requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("netprobe");

        let config = Config::from_config(Some(&path)).unwrap();
        assert!(dir.path().join("netprobe.toml").exists());
        assert_eq!(config.collector.port, 1984);
        assert_eq!(config.engine.dns, DnsStrategy::Standard);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
            [engine]
            concurrency = 12
            budget = "shared"
            dns = "only"

            [[hosts]]
            name = "gw.example.net"
            ip = "192.0.2.1"
            tags = ["ssh", "http://gw.example.net/"]
            "#,
        )
        .unwrap();

        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config.engine.concurrency, 12);
        assert_eq!(config.engine.budget, BudgetPolicy::Shared);
        assert_eq!(config.engine.dns, DnsStrategy::Only);
        assert_eq!(config.engine.tick_millis, 100);
        assert_eq!(config.hosts.len(), 1);
        assert_eq!(config.hosts[0].tags.len(), 2);
        assert!(config.to_string().contains("Concurrency: 12"));
    }

    #[test]
    fn concurrency_is_never_zero() {
        let mut config = Config::default();
        config.engine.concurrency = 0;
        assert!(config.effective_concurrency() >= 1);
    }
}
