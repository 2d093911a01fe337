//! TCP connect with per-address timeout and keep-alive.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::KEEPALIVE;

/// Connect to the first reachable address in `addrs`.
///
/// Each address gets its own `timeout`; the last error is returned if all
/// of them fail.
pub async fn connect(addrs: &[IpAddr], port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;

    for ip in addrs {
        let addr = SocketAddr::new(*ip, port);
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = configure(&stream) {
                    warn!(%addr, error = %e, "failed to set socket options");
                }
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "connect failed");
                last_err = Some(e);
            }
            Err(_) => {
                debug!(%addr, ?timeout, "connect timed out");
                last_err = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                ));
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to")))
}

fn configure(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
