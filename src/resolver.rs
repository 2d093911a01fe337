//! Hostname resolution for outbound connections.
//!
//! Lookups go through, in order:
//! 1. IP literals (returned as-is)
//! 2. Static host overrides
//! 3. The LRU/TTL cache
//! 4. A single shared in-flight lookup per hostname
//!
//! The lookup itself uses either the system resolver or, when a DNS server is
//! configured, a hickory resolver pointed at that server alone.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use hickory_resolver::TokioResolver;
use hickory_resolver::config::{LookupIpStrategy, NameServerConfig, ResolverConfig as UpstreamConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use lru::LruCache;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::transport::CONNECT_TIMEOUT;

pub const DEFAULT_CACHE_SIZE: usize = 32;
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(2 * 60 * 60);

type LookupResult = std::result::Result<(Arc<[IpAddr]>, Option<Duration>), String>;
type Lookup = Shared<BoxFuture<'static, LookupResult>>;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Static overrides, keyed by lowercase hostname.
    pub hosts: FxHashMap<String, IpAddr>,
    /// Query this server directly instead of using the system resolver.
    pub dns_server: Option<SocketAddr>,
    pub cache_size: usize,
    /// Upper bound on how long a resolution is reused.
    pub expiry: Duration,
    pub timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            hosts: FxHashMap::default(),
            dns_server: None,
            cache_size: DEFAULT_CACHE_SIZE,
            expiry: DEFAULT_EXPIRY,
            timeout: CONNECT_TIMEOUT,
        }
    }
}

struct CachedAddrs {
    addrs: Arc<[IpAddr]>,
    resolved_at: Instant,
    ttl: Duration,
}

pub struct Resolver {
    hosts: FxHashMap<String, IpAddr>,
    cache: Mutex<LruCache<String, CachedAddrs>>,
    in_flight: Mutex<FxHashMap<String, Lookup>>,
    remote: Option<Arc<TokioResolver>>,
    expiry: Duration,
    timeout: Duration,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            hosts: config
                .hosts
                .into_iter()
                .map(|(host, ip)| (host.to_ascii_lowercase(), ip))
                .collect(),
            cache: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(FxHashMap::default()),
            remote: config
                .dns_server
                .map(|server| Arc::new(remote_resolver(server, config.timeout))),
            expiry: config.expiry,
            timeout: config.timeout,
        }
    }

    /// Resolve `host` to one or more addresses.
    pub async fn resolve(&self, host: &str) -> Result<Arc<[IpAddr]>> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip].into());
        }

        let key = host.trim_end_matches('.').to_ascii_lowercase();
        if key.is_empty() {
            return Err(Error::Dns {
                host: host.to_string(),
                message: "empty hostname".into(),
            });
        }
        if let Some(ip) = self.hosts.get(&key) {
            trace!(host = %key, %ip, "host override");
            return Ok(vec![*ip].into());
        }
        if let Some(addrs) = self.cached(&key) {
            trace!(host = %key, "resolver cache hit");
            return Ok(addrs);
        }

        let lookup = self.join_or_start(&key);
        let result = lookup.clone().await;
        self.finish(&key, &lookup, &result);

        result.map(|(addrs, _)| addrs).map_err(|message| Error::Dns { host: key, message })
    }

    /// Number of live cache entries, expired ones included until touched.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn cached(&self, key: &str) -> Option<Arc<[IpAddr]>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.get(key)?;
        if entry.resolved_at.elapsed() < entry.ttl {
            return Some(entry.addrs.clone());
        }
        cache.pop(key);
        None
    }

    fn join_or_start(&self, key: &str) -> Lookup {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lookup) = in_flight.get(key) {
            trace!(host = %key, "joining in-flight lookup");
            return lookup.clone();
        }

        let lookup = run_lookup(key.to_string(), self.remote.clone(), self.timeout)
            .boxed()
            .shared();
        in_flight.insert(key.to_string(), lookup.clone());
        lookup
    }

    /// First waiter to finish retires the in-flight entry and caches the result.
    fn finish(&self, key: &str, lookup: &Lookup, result: &LookupResult) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let ours = in_flight
            .get(key)
            .is_some_and(|current| Shared::ptr_eq(current, lookup));
        if !ours {
            return;
        }
        in_flight.remove(key);

        if let Ok((addrs, ttl)) = result {
            let ttl = ttl.map_or(self.expiry, |ttl| ttl.min(self.expiry));
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            cache.put(
                key.to_string(),
                CachedAddrs {
                    addrs: addrs.clone(),
                    resolved_at: Instant::now(),
                    ttl,
                },
            );
        }
    }
}

/// A resolver that asks `server` only, over UDP with TCP for truncated
/// answers. Caching is left to [`Resolver`].
fn remote_resolver(server: SocketAddr, timeout: Duration) -> TokioResolver {
    let mut config = UpstreamConfig::new();
    config.add_name_server(NameServerConfig::new(server, Protocol::Udp));
    config.add_name_server(NameServerConfig::new(server, Protocol::Tcp));

    let mut opts = ResolverOpts::default();
    opts.cache_size = 0;
    opts.timeout = timeout;
    opts.attempts = 1;
    // A first, AAAA only when there is no IPv4 answer.
    opts.ip_strategy = LookupIpStrategy::Ipv4thenIpv6;

    hickory_resolver::Resolver::builder_with_config(config, TokioConnectionProvider::default())
        .with_options(opts)
        .build()
}

async fn run_lookup(host: String, remote: Option<Arc<TokioResolver>>, timeout: Duration) -> LookupResult {
    let result = match remote {
        Some(remote) => remote_lookup(&remote, &host, timeout).await,
        None => system_lookup(&host, timeout).await,
    };
    match &result {
        Ok((addrs, ttl)) => debug!(%host, addrs = addrs.len(), ?ttl, "resolved"),
        Err(e) => debug!(%host, error = %e, "resolution failed"),
    }
    result
}

async fn remote_lookup(remote: &TokioResolver, host: &str, timeout: Duration) -> LookupResult {
    let lookup = tokio::time::timeout(timeout, remote.lookup_ip(host))
        .await
        .map_err(|_| format!("remote lookup timed out after {timeout:?}"))?
        .map_err(|e| e.to_string())?;

    let ttl = lookup.valid_until().saturating_duration_since(Instant::now());
    let mut ips: Vec<IpAddr> = Vec::new();
    for ip in lookup.iter() {
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    if ips.is_empty() {
        return Err("no address records".into());
    }
    Ok((ips.into(), Some(ttl)))
}

async fn system_lookup(host: &str, timeout: Duration) -> LookupResult {
    let addrs = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0)))
        .await
        .map_err(|_| format!("system lookup timed out after {timeout:?}"))?
        .map_err(|e| e.to_string())?;

    let mut ips: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        if !ips.contains(&addr.ip()) {
            ips.push(addr.ip());
        }
    }
    if ips.is_empty() {
        return Err("no addresses".into());
    }
    Ok((ips.into(), None))
}
