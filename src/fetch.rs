//! Dedicated HTTP(S) client for downloading the rule list.
//!
//! Connections are opened through the [`Dialer`] so they pick up host
//! overrides, remote DNS and upstream chaining. TLS sessions are cached for
//! resumption across refresh cycles.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper::StatusCode;
use hyper::header::{HOST, USER_AGENT};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::client::Resumption;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};
use crate::transport::{BoxedStream, Dialer};

pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);
const TLS_SESSION_CACHE_SIZE: usize = 1000;

const USER_AGENT_VALUE: &str = concat!("autoproxy/", env!("CARGO_PKG_VERSION"));

pub struct Fetcher {
    dialer: Arc<Dialer>,
    tls: TlsConnector,
}

impl Fetcher {
    pub fn new(dialer: Arc<Dialer>) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
            .map_err(|e| Error::config(format!("TLS setup failed: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.resumption = Resumption::in_memory_sessions(TLS_SESSION_CACHE_SIZE);

        Ok(Self {
            dialer,
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    /// GET `url` and return the body of a `200 OK` response.
    pub async fn get(&self, url: &Url) -> Result<Bytes> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::fetch(url.as_str(), "URL has no host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::fetch(url.as_str(), "URL has no port"))?;

        let stream = self.dialer.dial(host, port).await?;
        let stream: BoxedStream = match url.scheme() {
            "https" => Box::new(self.handshake(url, host, stream).await?),
            "http" => stream,
            other => return Err(Error::fetch(url.as_str(), format!("unsupported scheme {other}"))),
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::fetch(url.as_str(), e))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                trace!(error = %e, "list fetch connection closed");
            }
        });

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let request = Request::get(path)
            .header(HOST, authority)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::fetch(url.as_str(), e))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::fetch(url.as_str(), e))?;
        if response.status() != StatusCode::OK {
            return Err(Error::fetch(url.as_str(), format!("status {}", response.status())));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::fetch(url.as_str(), e))?
            .to_bytes();
        debug!(url = %url, bytes = body.len(), "fetched");
        Ok(body)
    }

    async fn handshake(
        &self,
        url: &Url,
        host: &str,
        stream: BoxedStream,
    ) -> Result<tokio_rustls::client::TlsStream<BoxedStream>> {
        let name = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let server_name = ServerName::try_from(name)
            .map_err(|e| Error::fetch(url.as_str(), format!("invalid TLS server name: {e}")))?;

        tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, self.tls.connect(server_name, stream))
            .await
            .map_err(|_| Error::Timeout(TLS_HANDSHAKE_TIMEOUT))?
            .map_err(|e| Error::fetch(url.as_str(), format!("TLS handshake failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{Resolver, ResolverConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fetcher() -> Fetcher {
        let resolver = Arc::new(Resolver::new(ResolverConfig::default()));
        Fetcher::new(Arc::new(Dialer::new(resolver))).unwrap()
    }

    /// Serve one connection with `response`, returning the request head.
    async fn serve_once(response: &'static [u8]) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.ends_with(b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&head).to_string()
        });
        (port, handle)
    }

    #[tokio::test]
    async fn get_returns_body() {
        let (port, server) =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\nexample.com").await;
        let url = Url::parse(&format!("http://127.0.0.1:{port}/gfwlist.txt?raw=1")).unwrap();

        let body = fetcher().get(&url).await.unwrap();

        assert_eq!(&body[..], b"example.com");
        let head = server.await.unwrap();
        assert!(head.starts_with("GET /gfwlist.txt?raw=1 HTTP/1.1\r\n"));
        assert!(head.to_ascii_lowercase().contains(&format!("host: 127.0.0.1:{port}")));
    }

    #[tokio::test]
    async fn non_200_is_fetch_error() {
        let (port, _server) =
            serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let url = Url::parse(&format!("http://127.0.0.1:{port}/missing")).unwrap();

        let err = fetcher().get(&url).await.unwrap_err();

        assert!(matches!(err, Error::Fetch { ref message, .. } if message.contains("404")));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let (port, _server) = serve_once(b"").await;
        let url = Url::parse(&format!("ftp://127.0.0.1:{port}/list")).unwrap();

        assert!(matches!(fetcher().get(&url).await, Err(Error::Fetch { .. })));
    }
}
