//! Endpoint addressing for the ingress and egress sockets.
//!
//! `tcp://HOST:PORT` binds or connects a TCP socket; `ipc:///path` uses a
//! Unix domain socket at `path`.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::debug;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
#[error("unsupported endpoint `{0}`: expected tcp://HOST:PORT or ipc:///path")]
pub struct EndpointError(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Ipc(PathBuf),
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let raw = raw.trim();
        if let Some(addr) = raw.strip_prefix("tcp://") {
            if addr.rsplit_once(':').is_some_and(|(host, port)| {
                !host.is_empty() && port.parse::<u16>().is_ok()
            }) {
                return Ok(Self::Tcp(addr.to_string()));
            }
        } else if let Some(path) = raw.strip_prefix("ipc://") {
            if !path.is_empty() {
                return Ok(Self::Ipc(PathBuf::from(path)));
            }
        }
        Err(EndpointError(raw.to_string()))
    }

    pub async fn connect(&self) -> io::Result<(BoxedReader, BoxedWriter)> {
        match self {
            Self::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                let (read, write) = stream.into_split();
                Ok((Box::new(read), Box::new(write)))
            }
            Self::Ipc(path) => {
                let (read, write) = UnixStream::connect(path).await?.into_split();
                Ok((Box::new(read), Box::new(write)))
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

/// A bound endpoint.  Unix socket files are removed on drop.
pub enum Listener {
    Tcp(TcpListener),
    Ipc { listener: UnixListener, path: PathBuf },
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Self::Tcp(TcpListener::bind(addr).await?)),
            Endpoint::Ipc(path) => {
                remove_stale_socket(path);
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Ok(Self::Ipc {
                    listener: UnixListener::bind(path)?,
                    path: path.clone(),
                })
            }
        }
    }

    /// The endpoint actually bound; resolves `tcp://HOST:0` to the real port.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Self::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            Self::Ipc { path, .. } => Ok(Endpoint::Ipc(path.clone())),
        }
    }

    pub async fn accept(&self) -> io::Result<(BoxedReader, BoxedWriter, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (read, write) = stream.into_split();
                Ok((Box::new(read), Box::new(write), peer.to_string()))
            }
            Self::Ipc { listener, path } => {
                let (stream, _) = listener.accept().await?;
                let (read, write) = stream.into_split();
                Ok((Box::new(read), Box::new(write), path.display().to_string()))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Ipc { path, .. } = self {
            remove_stale_socket(path);
        }
    }
}

fn remove_stale_socket(path: &Path) {
    if path.exists() {
        debug!(path = %path.display(), "removing socket file");
        let _ = std::fs::remove_file(path);
    }
}
