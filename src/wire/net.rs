//! Network endpoints over unix-domain and TCP sockets.

use crate::config::types::{to_transport_error, Result, XprocError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::str::FromStr;

/// A dialable or bindable address with its family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// Build from a family name and an address string.
    pub fn parse(family: &str, addr: &str) -> Result<Self> {
        match family {
            "unix" => Ok(Endpoint::Unix(PathBuf::from(addr))),
            "tcp" | "tcp4" | "tcp6" => Ok(Endpoint::Tcp(addr.to_string())),
            other => Err(XprocError::Parse(format!(
                "unsupported address family '{}'",
                other
            ))),
        }
    }

    pub fn family(&self) -> &'static str {
        match self {
            Endpoint::Unix(_) => "unix",
            Endpoint::Tcp(_) => "tcp",
        }
    }

    pub fn address(&self) -> String {
        match self {
            Endpoint::Unix(path) => path.display().to_string(),
            Endpoint::Tcp(addr) => addr.clone(),
        }
    }

    pub fn connect(&self) -> Result<Stream> {
        match self {
            Endpoint::Unix(path) => UnixStream::connect(path)
                .map(Stream::Unix)
                .map_err(|e| to_transport_error(&format!("connect {}", self), e)),
            Endpoint::Tcp(addr) => TcpStream::connect(addr.as_str())
                .and_then(|s| {
                    s.set_nodelay(true)?;
                    Ok(s)
                })
                .map(Stream::Tcp)
                .map_err(|e| to_transport_error(&format!("connect {}", self), e)),
        }
    }

    /// Bind a listener. A leftover unix socket file at the path is removed first.
    pub fn bind(&self) -> Result<Listener> {
        match self {
            Endpoint::Unix(path) => {
                if let Ok(meta) = fs::symlink_metadata(path) {
                    if meta.file_type().is_socket() {
                        fs::remove_file(path)?;
                    }
                }
                let listener = UnixListener::bind(path)
                    .map_err(|e| to_transport_error(&format!("bind {}", self), e))?;
                Ok(Listener::Unix(listener, path.clone()))
            }
            Endpoint::Tcp(addr) => TcpListener::bind(addr.as_str())
                .map(Listener::Tcp)
                .map_err(|e| to_transport_error(&format!("bind {}", self), e)),
        }
    }

    /// Replace an unspecified TCP host (0.0.0.0, ::) with `ip`.
    pub fn with_host_if_unspecified(self, ip: IpAddr) -> Self {
        match &self {
            Endpoint::Tcp(addr) => match addr.parse::<SocketAddr>() {
                Ok(sock) if sock.ip().is_unspecified() => {
                    Endpoint::Tcp(SocketAddr::new(ip, sock.port()).to_string())
                }
                _ => self,
            },
            Endpoint::Unix(_) => self,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family(), self.address())
    }
}

impl FromStr for Endpoint {
    type Err = XprocError;

    /// Accepts `unix:/path`, `tcp:host:port`, a bare absolute path or a bare `host:port`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(XprocError::Parse("empty endpoint".to_string()));
        }
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        for prefix in ["tcp:", "tcp4:", "tcp6:"] {
            if let Some(addr) = s.strip_prefix(prefix) {
                return Ok(Endpoint::Tcp(addr.to_string()));
            }
        }
        if s.starts_with('/') {
            Ok(Endpoint::Unix(PathBuf::from(s)))
        } else {
            Ok(Endpoint::Tcp(s.to_string()))
        }
    }
}

/// Connected socket of either family.
#[derive(Debug)]
pub enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    pub fn try_clone(&self) -> Result<Stream> {
        Ok(match self {
            Stream::Unix(s) => Stream::Unix(s.try_clone()?),
            Stream::Tcp(s) => Stream::Tcp(s.try_clone()?),
        })
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.shutdown(how),
            Stream::Tcp(s) => s.shutdown(how),
        }
    }

    /// Local IP for TCP connections; used to work out which host we are.
    pub fn local_ip(&self) -> Option<IpAddr> {
        match self {
            Stream::Unix(_) => None,
            Stream::Tcp(s) => s.local_addr().ok().map(|a| a.ip()),
        }
    }
}

impl From<Stream> for OwnedFd {
    fn from(stream: Stream) -> OwnedFd {
        match stream {
            Stream::Unix(s) => OwnedFd::from(s),
            Stream::Tcp(s) => OwnedFd::from(s),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

/// Bound listener of either family.
#[derive(Debug)]
pub enum Listener {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

impl Listener {
    pub fn accept(&self) -> Result<Stream> {
        match self {
            Listener::Unix(l, _) => l
                .accept()
                .map(|(s, _)| Stream::Unix(s))
                .map_err(|e| to_transport_error("accept", e)),
            Listener::Tcp(l) => l
                .accept()
                .map(|(s, _)| {
                    let _ = s.set_nodelay(true);
                    Stream::Tcp(s)
                })
                .map_err(|e| to_transport_error("accept", e)),
        }
    }

    /// The endpoint peers should dial; for TCP this carries the bound port.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            Listener::Unix(_, path) => Ok(Endpoint::Unix(path.clone())),
            Listener::Tcp(l) => Ok(Endpoint::Tcp(l.local_addr()?.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parses_family_and_address() {
        assert_eq!(
            Endpoint::parse("unix", "/tmp/x").unwrap(),
            Endpoint::Unix("/tmp/x".into())
        );
        assert_eq!(
            Endpoint::parse("tcp4", "1.2.3.4:5").unwrap(),
            Endpoint::Tcp("1.2.3.4:5".into())
        );
        assert!(Endpoint::parse("udp", "x").is_err());
    }

    #[test]
    fn endpoint_strings_accept_prefixed_and_bare_forms() {
        assert_eq!(
            "unix:/run/x.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix("/run/x.sock".into())
        );
        assert_eq!(
            "/run/x.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix("/run/x.sock".into())
        );
        assert_eq!(
            "tcp:node3:6666".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("node3:6666".into())
        );
        assert_eq!(
            "node3:6666".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("node3:6666".into())
        );
        let ep = Endpoint::Tcp("n:1".into());
        assert_eq!(ep.to_string().parse::<Endpoint>().unwrap(), ep);
    }

    #[test]
    fn unspecified_host_is_replaced() {
        let ep = Endpoint::Tcp("0.0.0.0:4000".into())
            .with_host_if_unspecified(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(ep, Endpoint::Tcp("10.0.0.2:4000".into()));
        let kept = Endpoint::Tcp("10.0.0.9:1".into())
            .with_host_if_unspecified(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(kept, Endpoint::Tcp("10.0.0.9:1".into()));
    }

    #[test]
    fn unix_listener_rebinds_over_a_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoint::Unix(dir.path().join("s.sock"));
        let first = ep.bind().unwrap();
        drop(first);
        let listener = ep.bind().unwrap();
        let mut client = ep.connect().unwrap();
        let mut server = listener.accept().unwrap();
        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }
}
