//! Outbound connection plumbing.
//!
//! Every TCP connection the gateway opens goes through [`Dialer`], which
//! resolves the target with the shared [`Resolver`] and optionally tunnels
//! through an upstream proxy.

pub mod tcp;
pub mod upstream;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::{Error, Result};
use crate::resolver::Resolver;

pub use upstream::{ProxyKind, UpstreamProxy};

/// Default TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

/// TCP keep-alive idle time for dialed connections.
pub const KEEPALIVE: Duration = Duration::from_secs(30);

/// A bidirectional byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Opens TCP connections by hostname.
pub struct Dialer {
    resolver: Arc<Resolver>,
    upstream: Option<UpstreamProxy>,
}

impl Dialer {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self {
            resolver,
            upstream: None,
        }
    }

    /// Route every connection through `proxy`.
    pub fn with_upstream(mut self, proxy: UpstreamProxy) -> Self {
        self.upstream = Some(proxy);
        self
    }

    /// Connect to `host:port`.
    pub async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        match &self.upstream {
            Some(proxy) => {
                let addrs = self.resolver.resolve(proxy.host()).await?;
                let stream = tcp::connect(&addrs, proxy.port(), CONNECT_TIMEOUT)
                    .await
                    .map_err(|e| dial_error(proxy.host(), proxy.port(), e))?;
                debug!(proxy = %proxy, target = host, port, "tunnelling through upstream proxy");
                let stream = proxy
                    .handshake(stream, host, port)
                    .await
                    .map_err(|e| dial_error(host, port, e))?;
                Ok(Box::new(stream))
            }
            None => {
                let addrs = self.resolver.resolve(host).await?;
                let stream = tcp::connect(&addrs, port, CONNECT_TIMEOUT)
                    .await
                    .map_err(|e| dial_error(host, port, e))?;
                Ok(Box::new(stream))
            }
        }
    }
}

fn dial_error(host: &str, port: u16, e: std::io::Error) -> Error {
    Error::Io(std::io::Error::new(e.kind(), format!("dial {host}:{port}: {e}")))
}
