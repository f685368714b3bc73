//! Ephemeral listening endpoint for one worker launch.
//!
//! Endpoint kinds:
//! - **Abstract**: Linux abstract namespace socket (no filesystem entry, auto-cleanup)
//! - **Named**: filesystem unix socket in a private per-launch directory
//! - **Tcp**: loopback TCP, available on every platform
//!
//! The host binds, hands the address to the worker once, accepts exactly the
//! connections it expects and drops the endpoint. Streams are boxed so the
//! channel code above is independent of the endpoint kind.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Byte stream usable as either channel.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

pub type Connection = Box<dyn Duplex>;

/// Which kind of endpoint to create for a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    #[cfg(target_os = "linux")]
    Abstract,
    /// Socket file lives in a fresh subdirectory of `dir`.
    #[cfg(unix)]
    Named { dir: PathBuf },
    Tcp,
}

impl EndpointKind {
    /// Abstract on Linux, named elsewhere on unix, TCP loopback otherwise.
    pub fn platform_default() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Abstract
        }

        #[cfg(all(unix, not(target_os = "linux")))]
        {
            Self::Named {
                dir: std::env::temp_dir(),
            }
        }

        #[cfg(not(unix))]
        {
            Self::Tcp
        }
    }

    /// Parse the `OFFLOAD_ENDPOINT` spelling: `abstract`, `named` or `tcp`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            #[cfg(target_os = "linux")]
            "abstract" => Some(Self::Abstract),
            #[cfg(unix)]
            "named" => Some(Self::Named {
                dir: std::env::temp_dir(),
            }),
            "tcp" => Some(Self::Tcp),
            _ => None,
        }
    }
}

impl Default for EndpointKind {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// Address the worker connects to. Single use: valid for one launch only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndpointAddress {
    #[cfg(target_os = "linux")]
    Abstract { name: String },
    #[cfg(unix)]
    Named { path: PathBuf },
    Tcp { addr: SocketAddr },
}

impl std::fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(target_os = "linux")]
            Self::Abstract { name } => write!(f, "@{name}"),
            #[cfg(unix)]
            Self::Named { path } => write!(f, "{}", path.display()),
            Self::Tcp { addr } => write!(f, "tcp://{addr}"),
        }
    }
}

enum Listener {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Tcp(TcpListener),
}

/// Host-side listening endpoint.
pub struct Endpoint {
    address: EndpointAddress,
    listener: Listener,
    /// Private directory holding a named socket, removed on drop.
    cleanup_dir: Option<PathBuf>,
}

impl Endpoint {
    pub async fn bind(kind: &EndpointKind) -> io::Result<Self> {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let tag = &tag[..12];

        match kind {
            #[cfg(target_os = "linux")]
            EndpointKind::Abstract => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

                let name = format!("offload-{}-{}", std::process::id(), tag);
                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;

                let std_listener = StdUnixListener::bind_addr(&addr)?;
                std_listener.set_nonblocking(true)?;
                let listener = tokio::net::UnixListener::from_std(std_listener)?;

                tracing::debug!(endpoint = "abstract", name = %name, "Bound endpoint");
                Ok(Self {
                    address: EndpointAddress::Abstract { name },
                    listener: Listener::Unix(listener),
                    cleanup_dir: None,
                })
            }
            #[cfg(unix)]
            EndpointKind::Named { dir } => {
                let private = dir.join(format!("offload-{}-{}", std::process::id(), tag));
                std::fs::create_dir_all(&private)?;
                let path = private.join("worker.sock");

                let listener = match tokio::net::UnixListener::bind(&path) {
                    Ok(listener) => listener,
                    Err(e) => {
                        let _ = std::fs::remove_dir_all(&private);
                        return Err(e);
                    }
                };

                tracing::debug!(endpoint = "named", path = %path.display(), "Bound endpoint");
                Ok(Self {
                    address: EndpointAddress::Named { path },
                    listener: Listener::Unix(listener),
                    cleanup_dir: Some(private),
                })
            }
            EndpointKind::Tcp => {
                let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
                let addr = listener.local_addr()?;

                tracing::debug!(endpoint = "tcp", %addr, "Bound endpoint");
                Ok(Self {
                    address: EndpointAddress::Tcp { addr },
                    listener: Listener::Tcp(listener),
                    cleanup_dir: None,
                })
            }
        }
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Accept one inbound stream. Cancel-safe.
    pub async fn accept(&self) -> io::Result<Connection> {
        match &self.listener {
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                tracing::trace!(%peer, "Accepted tcp stream");
                Ok(Box::new(stream))
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(dir) = self.cleanup_dir.take()
            && dir.exists()
        {
            tracing::debug!(dir = %dir.display(), "Cleaning up socket directory");
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(error = %e, "Failed to cleanup socket directory");
            }
        }
    }
}

/// Connect from the worker side.
pub async fn connect(address: &EndpointAddress) -> io::Result<Connection> {
    match address {
        #[cfg(target_os = "linux")]
        EndpointAddress::Abstract { name } => {
            use std::os::linux::net::SocketAddrExt;
            use std::os::unix::net::SocketAddr;

            let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
            // tokio doesn't support abstract sockets directly
            let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            std_stream.set_nonblocking(true)?;
            let stream = tokio::net::UnixStream::from_std(std_stream)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        EndpointAddress::Named { path } => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        EndpointAddress::Tcp { addr } => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
    }
}
