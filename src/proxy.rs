//! Engine wiring and the PAC HTTP server.
//!
//! [`Engine`] builds one instance of every shared component for a configured
//! list source; [`run`] serves it until Ctrl-C.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::PacCache;
use crate::config::Config;
use crate::error::Result;
use crate::fetch::Fetcher;
use crate::filter::{self, Blocklist, Route};
use crate::pac::PacHandler;
use crate::resolver::{Resolver, ResolverConfig};
use crate::stats::Stats;
use crate::store::{FileStore, Store};
use crate::transport::{CONNECT_TIMEOUT, Dialer};
use crate::updater::{Download, ListUpdater, UpdaterHandle};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Every shared component for one list source.
pub struct Engine {
    handler: Arc<PacHandler>,
    blocklist: Option<Arc<Blocklist>>,
    filter_rule: Option<String>,
    updater: Option<Arc<ListUpdater>>,
    refresh_interval: Duration,
    cache: Arc<PacCache>,
    stats: Arc<Stats>,
    pac_path: Arc<str>,
}

impl Engine {
    /// Build an engine backed by `store_dir` that downloads over the network.
    pub fn from_config(config: &Config) -> Result<Self> {
        let source = config.list_source()?;

        let resolver = Arc::new(Resolver::new(ResolverConfig {
            hosts: source.hosts.clone(),
            dns_server: source.dns_server,
            cache_size: source.dns_cache_size,
            expiry: source.dns_expiry,
            timeout: CONNECT_TIMEOUT,
        }));
        let mut dialer = Dialer::new(resolver);
        if let Some(proxy) = source.upstream.clone() {
            info!(proxy = %proxy, "list downloads go through upstream proxy");
            dialer = dialer.with_upstream(proxy);
        }
        let fetcher = Fetcher::new(Arc::new(dialer))?;

        Self::new(config, Arc::new(FileStore::new(&config.store_dir)), Arc::new(fetcher))
    }

    pub fn new(config: &Config, store: Arc<dyn Store>, downloader: Arc<dyn Download>) -> Result<Self> {
        let source = config.list_source()?;
        let cache = Arc::new(PacCache::new());
        let stats = Arc::new(Stats::new());

        let (blocklist, updater) = if config.gfwlist.enabled {
            let blocklist = Arc::new(Blocklist::new());
            let updater = ListUpdater::new(
                &source,
                downloader,
                Arc::clone(&store),
                Arc::clone(&blocklist),
                Arc::clone(&cache),
                Arc::clone(&stats),
            );
            (Some(blocklist), Some(Arc::new(updater)))
        } else {
            (None, None)
        };

        let handler = PacHandler::new(
            store,
            blocklist.clone(),
            Arc::clone(&cache),
            Arc::clone(&stats),
            config.listen.clone(),
        );

        Ok(Self {
            handler: Arc::new(handler),
            blocklist,
            filter_rule: source.filter_rule,
            updater,
            refresh_interval: source.refresh_interval,
            cache,
            stats,
            pac_path: Arc::from(config.pac_path.as_str()),
        })
    }

    /// Load the initial list and start the refresh loop.
    ///
    /// Fails when no list can be loaded or downloaded.
    pub async fn start(&self) -> Result<Option<UpdaterHandle>> {
        let Some(updater) = &self.updater else {
            info!("rule list disabled; serving templates as-is");
            return Ok(None);
        };
        updater.load_initial().await?;
        Ok(Some(Arc::clone(updater).spawn(self.refresh_interval)))
    }

    /// Where the wider proxy should send a request for `host`.
    pub fn route(&self, host: &str) -> Route<'_> {
        match &self.blocklist {
            Some(blocklist) => filter::route(blocklist, self.filter_rule.as_deref(), host),
            None => Route::Direct,
        }
    }

    pub fn handler(&self) -> &Arc<PacHandler> {
        &self.handler
    }

    pub fn blocklist(&self) -> Option<&Arc<Blocklist>> {
        self.blocklist.as_ref()
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn cache(&self) -> &Arc<PacCache> {
        &self.cache
    }

    /// Log and reset the counters every minute.
    fn spawn_stats_logger(&self) -> JoinHandle<()> {
        let stats = Arc::clone(&self.stats);
        let cache = Arc::clone(&self.cache);
        let blocklist = self.blocklist.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            interval.tick().await; // Skip first immediate tick
            loop {
                interval.tick().await;
                let s = stats.snapshot_and_reset();
                let list = blocklist.as_ref().map(|b| b.snapshot());
                let fetched_at = list
                    .as_ref()
                    .map_or_else(|| "-".to_string(), |l| l.fetched_at().to_rfc3339());
                info!(
                    requests = s.requests,
                    hits = s.cache_hits,
                    misses = s.cache_misses,
                    failed = s.failed_requests,
                    list_updates = s.list_updates,
                    failed_updates = s.failed_updates,
                    avg_response_ms = %format!("{:.2}", s.avg_response_ms),
                    cached = cache.len(),
                    domains = list.as_ref().map_or(0, |l| l.len()),
                    list_fetched_at = %fetched_at,
                    "stats"
                );
            }
        })
    }
}

/// Run the PAC server until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let addr = config.listen_addr()?;
    let engine = Engine::from_config(&config)?;
    let updater = engine.start().await?;

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, path = %engine.pac_path, "PAC server listening");
    let stats_task = engine.spawn_stats_logger();

    tokio::select! {
        _ = serve(listener, Arc::clone(&engine.handler), Arc::clone(&engine.pac_path)) => {},
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    stats_task.abort();
    if let Some(updater) = updater {
        updater.shutdown().await;
    }
    Ok(())
}

/// Accept connections forever, answering `pac_path` and 404 elsewhere.
pub async fn serve(listener: TcpListener, handler: Arc<PacHandler>, pac_path: Arc<str>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let pac_path = Arc::clone(&pac_path);
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = Arc::clone(&handler);
                let pac_path = Arc::clone(&pac_path);
                async move { Ok::<_, Infallible>(dispatch(&handler, &pac_path, req).await) }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(%peer, error = %e, "connection error");
            }
        });
    }
}

async fn dispatch<B>(handler: &PacHandler, pac_path: &str, req: Request<B>) -> Response<Full<Bytes>> {
    if req.uri().path() == pac_path {
        return handler.respond(req).await;
    }

    debug!(path = req.uri().path(), "no such endpoint");
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
