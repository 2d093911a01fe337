//! Configuration loading and validation.
//!
//! The configuration is a JSON file; every section and field is optional and
//! falls back to its default. [`Config::list_source`] turns the raw values
//! into the validated [`ListSource`] the engine is built from.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::resolver::DEFAULT_CACHE_SIZE;
use crate::transport::UpstreamProxy;

pub const DEFAULT_LIST_URL: &str = "https://raw.githubusercontent.com/gfwlist/gfwlist/master/gfwlist.txt";
const DNS_PORT: u16 = 53;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Address the PAC server listens on.
    pub listen: String,

    /// Request path the PAC script is served at.
    pub pac_path: String,

    /// Directory holding the downloaded list and PAC templates.
    pub store_dir: PathBuf,

    /// Static hostname to IP overrides for outbound connections.
    pub hosts: BTreeMap<String, String>,

    pub gfwlist: GfwListConfig,

    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8087".to_string(),
            pac_path: "/proxy.pac".to_string(),
            store_dir: PathBuf::from("."),
            hosts: BTreeMap::new(),
            gfwlist: GfwListConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Content encoding of the remote list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Identity,
    #[default]
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    /// `http://host:port` or `socks5://host:port`.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    pub enabled: bool,
    /// Name of the filter that blocked hosts are handed to.
    pub rule: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rule: "direct".to_string(),
        }
    }
}

/// Rule list source section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GfwListConfig {
    pub enabled: bool,
    pub url: String,
    /// Name of the local copy inside `store_dir`.
    pub filename: String,
    pub encoding: Encoding,
    /// Refresh interval in seconds.
    pub duration: u64,
    /// A local copy younger than this many seconds is not refreshed.
    pub expiry: u64,
    /// Deadline for a single download, in seconds.
    pub fetch_timeout: u64,
    pub proxy: ProxyConfig,
    pub filter: FilterConfig,
    pub enable_remote_dns: bool,
    /// `ip` or `ip:port`; port 53 when omitted.
    pub dns_server: String,
    pub dns_cache_size: usize,
    /// Resolver cache lifetime in seconds; the refresh interval when unset.
    pub dns_expiry: Option<u64>,
}

impl Default for GfwListConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: DEFAULT_LIST_URL.to_string(),
            filename: "gfwlist.txt".to_string(),
            encoding: Encoding::Base64,
            duration: 3 * 60 * 60,
            expiry: 24 * 60 * 60,
            fetch_timeout: 60,
            proxy: ProxyConfig::default(),
            filter: FilterConfig::default(),
            enable_remote_dns: false,
            dns_server: "8.8.8.8".to_string(),
            dns_cache_size: DEFAULT_CACHE_SIZE,
            dns_expiry: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error.
    pub level: String,

    /// stdout, stderr, or a file path.
    pub output: String,

    pub format: LogFormat,

    /// Include the module path in each line.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
            format: LogFormat::Pretty,
            include_target: false,
        }
    }
}

/// Validated, immutable description of where the rule list comes from and
/// how it is fetched.
#[derive(Debug, Clone)]
pub struct ListSource {
    pub url: Url,
    pub filename: String,
    pub encoding: Encoding,
    pub refresh_interval: Duration,
    pub expiry: Duration,
    pub fetch_timeout: Duration,
    pub upstream: Option<UpstreamProxy>,
    pub filter_rule: Option<String>,
    pub dns_server: Option<SocketAddr>,
    pub dns_cache_size: usize,
    pub dns_expiry: Duration,
    pub hosts: FxHashMap<String, IpAddr>,
}

impl Config {
    /// Read and parse the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("reading {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("parsing {}: {e}", path.display())))?;
        config.listen_addr()?;
        if !config.pac_path.starts_with('/') {
            return Err(Error::config(format!("pac_path must start with '/': {:?}", config.pac_path)));
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| Error::config(format!("invalid listen address {:?}: {e}", self.listen)))
    }

    pub fn list_source(&self) -> Result<ListSource> {
        let list = &self.gfwlist;

        let url = Url::parse(&list.url)
            .map_err(|e| Error::config(format!("invalid list url {:?}: {e}", list.url)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(Error::config(format!("list url must be http(s) with a host: {url}")));
        }
        if list.filename.is_empty() {
            return Err(Error::config("list filename is empty"));
        }
        if list.duration == 0 {
            return Err(Error::config("refresh duration must be positive"));
        }

        let upstream = if list.proxy.enabled {
            let proxy_url = Url::parse(&list.proxy.url).map_err(|e| {
                Error::config(format!("invalid upstream proxy url {:?}: {e}", list.proxy.url))
            })?;
            Some(UpstreamProxy::from_url(&proxy_url)?)
        } else {
            None
        };

        let filter_rule = match &list.filter {
            FilterConfig { enabled: true, rule } if rule.is_empty() => {
                return Err(Error::config("filter rule is enabled but empty"));
            }
            FilterConfig { enabled: true, rule } => Some(rule.clone()),
            _ => None,
        };

        let dns_server = if list.enable_remote_dns {
            Some(parse_dns_server(&list.dns_server)?)
        } else {
            None
        };

        let mut hosts = FxHashMap::default();
        for (host, ip) in &self.hosts {
            let ip: IpAddr = ip
                .parse()
                .map_err(|_| Error::config(format!("invalid address {ip:?} for host {host}")))?;
            hosts.insert(host.to_ascii_lowercase(), ip);
        }

        let refresh_interval = Duration::from_secs(list.duration);
        Ok(ListSource {
            url,
            filename: list.filename.clone(),
            encoding: list.encoding,
            refresh_interval,
            expiry: Duration::from_secs(list.expiry),
            fetch_timeout: Duration::from_secs(list.fetch_timeout.max(1)),
            upstream,
            filter_rule,
            dns_server,
            dns_cache_size: list.dns_cache_size,
            dns_expiry: list.dns_expiry.map_or(refresh_interval, Duration::from_secs),
            hosts,
        })
    }
}

fn parse_dns_server(value: &str) -> Result<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| Error::config(format!("invalid dns server {value:?}")))
}
