//! Configuration loading and the hot-reloadable runtime view.
//!
//! The file is YAML. Boot-only sections (listen, http, destinations) are
//! read once at startup; the reloadable sections (enrichment rules,
//! security, telegram, log level) are compiled into a [`RuntimeConfig`]
//! behind a process-wide `RwLock` and swapped wholesale on SIGHUP. A failed
//! reload leaves the previous runtime config in effect.

use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::RwLock;

use anyhow::{Context, Result, bail};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::Deserialize;

use crate::enrichment::EnrichmentRule;

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    6343
}

fn default_http_address() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_stats_interval() -> u64 {
    60
}

fn default_drop_rate_threshold() -> f64 {
    5.0
}

fn default_http_timeout() -> u64 {
    15
}

fn default_flap_cooldown() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            address: default_listen_address(),
            port: default_listen_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct HttpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_http_address")]
    pub address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            enabled: false,
            address: default_http_address(),
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DestinationConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub primary: bool,
    /// Name of another destination to divert to while this one is down.
    #[serde(default)]
    pub failover: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct EnrichmentConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RuleConfig {
    pub name: String,
    pub network: String,
    #[serde(default)]
    pub match_as: u32,
    pub set_as: u32,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Seconds between periodic stats log lines and drop-rate checks.
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
            stats_interval: default_stats_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SecurityConfig {
    #[serde(default)]
    pub whitelist_enabled: bool,
    /// CIDR prefixes or bare addresses (promoted to /32 or /128).
    #[serde(default)]
    pub whitelist_sources: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    /// Subset of {startup, shutdown, destination_down, destination_up,
    /// high_drop_rate, ipv6_degraded}.
    #[serde(default)]
    pub alert_on: Vec<String>,
    /// Percentage of dropped packets per stats interval that triggers a
    /// high_drop_rate alert.
    #[serde(default = "default_drop_rate_threshold")]
    pub drop_rate_threshold: f64,
    /// Seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,
    /// Seconds between repeated alerts for the same (kind, key).
    #[serde(default = "default_flap_cooldown")]
    pub flap_cooldown: u64,
    /// Deliver over IPv6 first and fall back to IPv4 on connect failure.
    #[serde(default)]
    pub ipv6_fallback: bool,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        TelegramConfig {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            alert_on: Vec::new(),
            drop_rate_threshold: default_drop_rate_threshold(),
            http_timeout: default_http_timeout(),
            flap_cooldown: default_flap_cooldown(),
            ipv6_fallback: false,
        }
    }
}

impl Config {
    pub(crate) fn load(path: &Path) -> Result<Config> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub(crate) fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen.address, self.listen.port)
    }

    pub(crate) fn http_addr(&self) -> String {
        format!("{}:{}", self.http.address, self.http.port)
    }

    /// Compiles the reloadable sections, validating every prefix.
    pub(crate) fn runtime(&self) -> Result<RuntimeConfig> {
        let mut rules = Vec::with_capacity(self.enrichment.rules.len());
        for rule in &self.enrichment.rules {
            let network: IpNet = rule
                .network
                .parse()
                .with_context(|| format!("rule {}: invalid network {}", rule.name, rule.network))?;
            rules.push(EnrichmentRule {
                name: rule.name.clone(),
                network,
                match_as: rule.match_as,
                set_as: rule.set_as,
                overwrite: rule.overwrite,
            });
        }

        let mut whitelist_nets = Vec::with_capacity(self.security.whitelist_sources.len());
        for source in &self.security.whitelist_sources {
            whitelist_nets.push(
                parse_source(source)
                    .with_context(|| format!("invalid whitelist source {source}"))?,
            );
        }

        Ok(RuntimeConfig {
            rules,
            whitelist_enabled: self.security.whitelist_enabled,
            whitelist_sources: self.security.whitelist_sources.clone(),
            whitelist_nets,
            telegram: self.telegram.clone(),
            log_level: self.logging.level.clone(),
        })
    }
}

/// Parses a whitelist entry: a CIDR prefix, or a bare address promoted to
/// its host prefix.
fn parse_source(source: &str) -> Result<IpNet> {
    if let Ok(net) = IpNet::from_str(source) {
        return Ok(net);
    }
    match IpAddr::from_str(source) {
        Ok(IpAddr::V4(addr)) => Ok(IpNet::V4(
            Ipv4Net::new(addr, 32).expect("/32 is always a valid prefix length"),
        )),
        Ok(IpAddr::V6(addr)) => Ok(IpNet::V6(
            Ipv6Net::new(addr, 128).expect("/128 is always a valid prefix length"),
        )),
        Err(_) => bail!("neither a CIDR prefix nor an address"),
    }
}

/// The reloadable view shared by the ingest loop, the enricher, the
/// notifier and the status surface.
#[derive(Debug)]
pub(crate) struct RuntimeConfig {
    pub rules: Vec<EnrichmentRule>,
    pub whitelist_enabled: bool,
    pub whitelist_sources: Vec<String>,
    pub whitelist_nets: Vec<IpNet>,
    pub telegram: TelegramConfig,
    pub log_level: String,
}

impl RuntimeConfig {
    pub(crate) fn is_whitelisted(&self, ip: IpAddr) -> bool {
        if !self.whitelist_enabled {
            return true;
        }
        self.whitelist_nets.iter().any(|net| net.contains(&ip))
    }
}

/// Re-reads the file and swaps the reloadable sections in. Boot-only
/// sections (listen, http, destinations) are ignored until restart.
pub(crate) fn reload(path: &Path, runtime: &RwLock<RuntimeConfig>) -> Result<usize> {
    let config = Config::load(path)?;
    let next = config.runtime()?;
    let rule_count = next.rules.len();
    match runtime.write() {
        Ok(mut guard) => *guard = next,
        Err(_) => bail!("runtime config lock poisoned"),
    }
    Ok(rule_count)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("create temp config");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    const FULL: &str = r#"
listen: { address: "0.0.0.0", port: 6343 }
http: { enabled: true }
destinations:
  - { name: primary, address: 127.0.0.1, port: 9001, enabled: true, primary: true, failover: backup }
  - { name: backup, address: 127.0.0.1, port: 9002, enabled: true }
enrichment:
  rules:
    - { name: own-prefix, network: 10.0.0.0/24, match_as: 64500, set_as: 65001 }
security:
  whitelist_enabled: true
  whitelist_sources: ["192.0.2.1", "10.0.0.0/8", "2001:db8::1"]
telegram:
  enabled: true
  bot_token: token
  chat_id: "42"
  alert_on: [startup, destination_down]
"#;

    #[test]
    fn loads_full_config_with_defaults() {
        let file = write_config(FULL);
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.listen_addr(), "0.0.0.0:6343");
        assert_eq!(config.http_addr(), "127.0.0.1:8080");
        assert!(config.http.enabled);
        assert_eq!(config.destinations.len(), 2);
        assert_eq!(config.destinations[0].failover, "backup");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.stats_interval, 60);
        assert_eq!(config.telegram.drop_rate_threshold, 5.0);
        assert_eq!(config.telegram.http_timeout, 15);
        assert_eq!(config.telegram.flap_cooldown, 300);

        let runtime = config.runtime().unwrap();
        assert_eq!(runtime.rules.len(), 1);
        assert_eq!(runtime.rules[0].set_as, 65001);
        assert!(!runtime.rules[0].overwrite);
        assert_eq!(runtime.whitelist_nets.len(), 3);
    }

    #[test]
    fn bare_addresses_promote_to_host_prefixes() {
        assert_eq!(
            parse_source("192.0.2.1").unwrap().to_string(),
            "192.0.2.1/32"
        );
        assert_eq!(
            parse_source("2001:db8::1").unwrap().to_string(),
            "2001:db8::1/128"
        );
        assert_eq!(
            parse_source("10.0.0.0/8").unwrap().to_string(),
            "10.0.0.0/8"
        );
        assert!(parse_source("not-an-address").is_err());
    }

    #[test]
    fn whitelist_totality() {
        let file = write_config("security: { whitelist_enabled: false }");
        let runtime = Config::load(file.path()).unwrap().runtime().unwrap();
        assert!(runtime.is_whitelisted("203.0.113.9".parse().unwrap()));

        let file = write_config("security: { whitelist_enabled: true, whitelist_sources: [] }");
        let runtime = Config::load(file.path()).unwrap().runtime().unwrap();
        assert!(!runtime.is_whitelisted("203.0.113.9".parse().unwrap()));

        let file = write_config(
            "security: { whitelist_enabled: true, whitelist_sources: [\"10.0.0.0/8\"] }",
        );
        let runtime = Config::load(file.path()).unwrap().runtime().unwrap();
        assert!(runtime.is_whitelisted("10.1.2.3".parse().unwrap()));
        assert!(!runtime.is_whitelisted("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn invalid_rule_network_is_rejected() {
        let file = write_config(
            "enrichment: { rules: [ { name: bad, network: nonsense, set_as: 1 } ] }",
        );
        let config = Config::load(file.path()).unwrap();
        assert!(config.runtime().is_err());
    }

    #[test]
    fn reload_swaps_runtime_and_keeps_old_on_error() {
        let file = write_config(FULL);
        let config = Config::load(file.path()).unwrap();
        let runtime = RwLock::new(config.runtime().unwrap());

        let updated = write_config(
            r#"
enrichment:
  rules:
    - { name: a, network: 10.0.0.0/24, set_as: 65001 }
    - { name: b, network: 10.0.1.0/24, set_as: 65002 }
"#,
        );
        assert_eq!(reload(updated.path(), &runtime).unwrap(), 2);
        {
            let guard = runtime.read().unwrap();
            assert_eq!(guard.rules.len(), 2);
            assert!(!guard.whitelist_enabled);
        }

        let broken = write_config("enrichment: { rules: [ { name: x, network: zzz, set_as: 1 } ] }");
        assert!(reload(broken.path(), &runtime).is_err());
        let guard = runtime.read().unwrap();
        assert_eq!(guard.rules.len(), 2, "failed reload must keep the old config");
    }
}
