//! Upstream proxy chaining: HTTP `CONNECT` and SOCKS5 (no auth).

use std::fmt;
use std::io;
use std::net::IpAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::error::{Error, Result};

/// Longest `CONNECT` response head we are willing to buffer.
const MAX_CONNECT_RESPONSE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks5,
}

/// An upstream proxy every dialed connection is tunnelled through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    kind: ProxyKind,
    host: String,
    port: u16,
}

impl UpstreamProxy {
    /// Accepts `http://host[:port]`, `socks5://host[:port]` and `socks5h://host[:port]`.
    pub fn from_url(url: &Url) -> Result<Self> {
        let (kind, default_port) = match url.scheme() {
            "http" => (ProxyKind::Http, 8080),
            "socks5" | "socks5h" => (ProxyKind::Socks5, 1080),
            other => {
                return Err(Error::config(format!(
                    "unsupported upstream proxy scheme {other:?} in {url}"
                )));
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::config(format!("upstream proxy {url} has no host")))?;

        Ok(Self {
            kind,
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: url.port().unwrap_or(default_port),
        })
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Ask the proxy, already connected on `stream`, for a tunnel to `host:port`.
    pub async fn handshake(&self, mut stream: TcpStream, host: &str, port: u16) -> io::Result<TcpStream> {
        match self.kind {
            ProxyKind::Http => http_connect(&mut stream, host, port).await?,
            ProxyKind::Socks5 => socks5_connect(&mut stream, host, port).await?,
        }
        Ok(stream)
    }
}

impl fmt::Display for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.kind {
            ProxyKind::Http => "http",
            ProxyKind::Socks5 => "socks5",
        };
        if self.host.contains(':') {
            write!(f, "{scheme}://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{scheme}://{}:{}", self.host, self.port)
        }
    }
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

async fn http_connect(stream: &mut TcpStream, host: &str, port: u16) -> io::Result<()> {
    let target = authority(host, port);
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Byte at a time so nothing past the response head is consumed.
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "CONNECT response head too large",
            ));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed connection during CONNECT",
            ));
        }
        head.push(byte[0]);
    }

    let status_line = head.split(|&b| b == b'\n').next().unwrap_or_default();
    let status_line = String::from_utf8_lossy(status_line);
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let status = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") || status != "200" {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy refused CONNECT {target}: {}", status_line.trim()),
        ));
    }
    Ok(())
}

async fn socks5_connect(stream: &mut TcpStream, host: &str, port: u16) -> io::Result<()> {
    // Greeting: version 5, one method, no authentication.
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [0x05, 0x00] {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("SOCKS5 proxy rejected no-auth method: {choice:?}"),
        ));
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            request.push(0x01);
            request.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            request.push(0x04);
            request.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            let len = u8::try_from(name.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "hostname too long for SOCKS5")
            })?;
            request.push(0x03);
            request.push(len);
            request.extend_from_slice(name);
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 || reply[1] != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("SOCKS5 connect to {host}:{port} failed with code {}", reply[1]),
        ));
    }

    // Discard the bound address.
    let skip = match reply[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("SOCKS5 reply with unknown address type {other}"),
            ));
        }
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[test]
    fn from_url_parses_schemes_and_ports() {
        let http = UpstreamProxy::from_url(&Url::parse("http://proxy.lan:3128").unwrap()).unwrap();
        assert_eq!(http.kind(), ProxyKind::Http);
        assert_eq!((http.host(), http.port()), ("proxy.lan", 3128));

        let socks = UpstreamProxy::from_url(&Url::parse("socks5://127.0.0.1").unwrap()).unwrap();
        assert_eq!(socks.kind(), ProxyKind::Socks5);
        assert_eq!(socks.port(), 1080);

        let err = UpstreamProxy::from_url(&Url::parse("ftp://proxy.lan").unwrap()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn http_connect_accepts_200() {
        let (client, mut server) = pair().await;
        let proxy = UpstreamProxy::from_url(&Url::parse("http://proxy.lan:3128").unwrap()).unwrap();

        let serve = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nhello")
                .await
                .unwrap();
            request
        });

        let mut tunnel = proxy.handshake(client, "example.com", 443).await.unwrap();
        let request = serve.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));

        // Bytes after the response head belong to the tunnel.
        let mut rest = [0u8; 5];
        tunnel.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"hello");
    }

    #[tokio::test]
    async fn http_connect_rejects_non_200() {
        let (client, mut server) = pair().await;
        let proxy = UpstreamProxy::from_url(&Url::parse("http://proxy.lan").unwrap()).unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let err = proxy.handshake(client, "example.com", 443).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn socks5_sends_hostname() {
        let (client, mut server) = pair().await;
        let proxy = UpstreamProxy::from_url(&Url::parse("socks5://127.0.0.1:1080").unwrap()).unwrap();

        let serve = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            server.read_exact(&mut head).await.unwrap();
            let mut name = vec![0u8; head[4] as usize + 2];
            server.read_exact(&mut name).await.unwrap();

            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
                .await
                .unwrap();
            (greeting, head, name)
        });

        proxy.handshake(client, "example.com", 443).await.unwrap();
        let (greeting, head, name) = serve.await.unwrap();

        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        assert_eq!(head, [0x05, 0x01, 0x00, 0x03, 11]);
        assert_eq!(&name[..11], b"example.com");
        assert_eq!(&name[11..], &443u16.to_be_bytes());
    }
}
