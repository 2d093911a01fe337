//! PAC endpoint.
//!
//! Serves a cached script when one is fresh, otherwise renders one from the
//! stored template and the current domain list. Either way the placeholder
//! proxy address is rewritten to the host the client used to reach us.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderMap, HeaderValue};
use hyper::http::uri::Authority;
use hyper::{Request, Response, StatusCode};
use tracing::{debug, error, warn};

use crate::cache::{PAC_CACHE_TTL, PacCache};
use crate::error::Result;
use crate::filter::Blocklist;
use crate::pac::render::{default_template, render, rewrite_placeholder};
use crate::stats::Stats;
use crate::store::Store;

const DEFAULT_HTTP_PORT: &str = "80";

/// Answers PAC requests.
pub struct PacHandler {
    store: Arc<dyn Store>,
    /// `None` serves the stored template as-is.
    blocklist: Option<Arc<Blocklist>>,
    cache: Arc<PacCache>,
    stats: Arc<Stats>,
    /// Used when a request carries no usable `Host`.
    fallback_authority: String,
}

impl PacHandler {
    pub fn new(
        store: Arc<dyn Store>,
        blocklist: Option<Arc<Blocklist>>,
        cache: Arc<PacCache>,
        stats: Arc<Stats>,
        fallback_authority: impl Into<String>,
    ) -> Self {
        Self {
            store,
            blocklist,
            cache,
            stats,
            fallback_authority: fallback_authority.into(),
        }
    }

    /// Produce the PAC body for `path` as seen by a client that sent `host`.
    pub async fn handle(&self, path: &str, host: Option<&str>) -> Result<String> {
        let start = Instant::now();
        let (authority, port) = client_authority(host, &self.fallback_authority);

        if let Some(body) = self.cache.get(path) {
            let body = rewrite_placeholder(&body, &authority).into_owned();
            self.stats.record_hit(elapsed_ms(start));
            return Ok(body);
        }

        let body = self.generate(path, &port).await?;
        let body = rewrite_placeholder(&body, &authority).into_owned();
        self.stats.record_miss(elapsed_ms(start));
        Ok(body)
    }

    /// Render and cache the un-rewritten body for `path`.
    async fn generate(&self, path: &str, port: &str) -> Result<Arc<str>> {
        let generation = self.cache.generation();
        let template = self.load_template(path, port).await?;

        let body: Arc<str> = match &self.blocklist {
            Some(blocklist) => render(&template, blocklist.snapshot().domains())?.into(),
            None => template.into(),
        };

        if !self
            .cache
            .set_if_current(path, Arc::clone(&body), PAC_CACHE_TTL, generation)
        {
            debug!(path, "list changed while rendering; not caching");
        }
        Ok(body)
    }

    /// Read the template for `path`, writing the default one on first use.
    async fn load_template(&self, path: &str, port: &str) -> Result<String> {
        let filename = path.trim_start_matches('/');

        match self.store.get(filename).await {
            Ok(object) => Ok(String::from_utf8_lossy(&object.content).into_owned()),
            Err(e) if e.is_not_found() => {
                debug!(filename, "generating default PAC template");
                let template = default_template(port);
                if let Err(e) = self
                    .store
                    .put(filename, HeaderMap::new(), Bytes::from(template.clone()))
                    .await
                {
                    warn!(filename, error = %e, "failed to persist default PAC template");
                }
                Ok(template)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Serve a PAC request as a complete, non-keep-alive HTTP response.
    pub async fn respond<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()))
            .map(str::to_string);
        let path = req.uri().path().to_string();
        drop(req);

        match self.handle(&path, host.as_deref()).await {
            Ok(body) => pac_response(StatusCode::OK, Bytes::from(body)),
            Err(e) => {
                self.stats.record_failed_request();
                error!(path = %path, error = %e, "failed to serve PAC");
                pac_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Bytes::from(format!("{e}\n")),
                )
            }
        }
    }
}

fn pac_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.clone()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Returns `(host:port, port)` for the address the client used.
///
/// The port defaults to 80 when `Host` has none. A missing or malformed
/// `Host` falls back to `fallback`.
fn client_authority(host: Option<&str>, fallback: &str) -> (String, String) {
    let parsed = host
        .and_then(|h| Authority::from_str(h).ok())
        .filter(is_plain_authority)
        .or_else(|| Authority::from_str(fallback).ok());

    match parsed {
        Some(authority) => match authority.port_u16() {
            Some(port) => (authority.as_str().to_string(), port.to_string()),
            None => (
                format!("{}:{DEFAULT_HTTP_PORT}", authority.host()),
                DEFAULT_HTTP_PORT.to_string(),
            ),
        },
        None => (
            format!("{fallback}:{DEFAULT_HTTP_PORT}"),
            DEFAULT_HTTP_PORT.to_string(),
        ),
    }
}

/// No userinfo, and nothing in the host that could break out of a JS string.
fn is_plain_authority(authority: &Authority) -> bool {
    !authority.as_str().contains('@')
        && authority
            .host()
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b'[' | b']' | b':'))
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
