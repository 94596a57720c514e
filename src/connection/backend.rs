//! Transports behind the channel: local-domain sockets and TCP loopback.
//!
//! A client backend goes `Idle -> Connected`; a server backend goes
//! `Idle -> Listening` and hands out one connected [`Transport`] per accepted
//! peer.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use super::error::{ConnectionError, ConnectionResult};

/// Transport family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Local,
    Tcp,
}

impl FromStr for TransportKind {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(TransportKind::Local),
            "tcp" => Ok(TransportKind::Tcp),
            other => Err(ConnectionError::InvalidAddress(other.to_string())),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Local => f.write_str("local"),
            TransportKind::Tcp => f.write_str("tcp"),
        }
    }
}

/// Endpoint address, written as `local:<path>` or `tcp:<ip>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Local(PathBuf),
    Tcp(SocketAddr),
}

impl Address {
    pub fn kind(&self) -> TransportKind {
        match self {
            Address::Local(_) => TransportKind::Local,
            Address::Tcp(_) => TransportKind::Tcp,
        }
    }
}

impl FromStr for Address {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConnectionError::InvalidAddress(s.to_string());
        if let Some(path) = s.strip_prefix("local:") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Address::Local(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            return addr.parse().map(Address::Tcp).map_err(|_| invalid());
        }
        Err(invalid())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Local(path) => write!(f, "local:{}", path.display()),
            Address::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// A connected byte stream.
#[derive(Debug)]
pub enum Transport {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Transport {
    async fn open(address: &Address) -> io::Result<Self> {
        match address {
            Address::Local(path) => UnixStream::connect(path).await.map(Transport::Unix),
            Address::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Transport::Tcp(stream))
            }
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Backend lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Idle,
    Listening,
    Connected,
    Closed,
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// Connect/listen state machine over one transport family.
pub struct ChannelBackend {
    kind: TransportKind,
    state: BackendState,
    socket_dir: Option<PathBuf>,
    listener: Option<Listener>,
    address: Option<Address>,
}

impl ChannelBackend {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            state: BackendState::Idle,
            socket_dir: None,
            listener: None,
            address: None,
        }
    }

    /// Directory for local socket files. Defaults to the user runtime
    /// directory, then the system temp directory.
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    /// Address this backend listens on or is connected to.
    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    /// Connect to `address`, bounded by `timeout`.
    pub async fn connect(
        &mut self,
        address: &Address,
        timeout: Duration,
    ) -> ConnectionResult<Transport> {
        if self.state != BackendState::Idle {
            return Err(ConnectionError::InvalidState("idle"));
        }
        let transport = tokio::time::timeout(timeout, Transport::open(address))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout {
                address: address.to_string(),
                timeout,
            })??;
        self.address = Some(address.clone());
        self.state = BackendState::Connected;
        Ok(transport)
    }

    /// Bind an ephemeral endpoint and start listening.
    pub fn listen(&mut self) -> ConnectionResult<Address> {
        if self.state != BackendState::Idle {
            return Err(ConnectionError::InvalidState("idle"));
        }
        let (listener, address) = match self.kind {
            TransportKind::Local => {
                let path = self.socket_path();
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)?;
                (Listener::Unix(listener), Address::Local(path))
            }
            TransportKind::Tcp => {
                let std_listener =
                    std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
                std_listener.set_nonblocking(true)?;
                let listener = TcpListener::from_std(std_listener)?;
                let local = listener.local_addr()?;
                (Listener::Tcp(listener), Address::Tcp(local))
            }
        };
        tracing::debug!(address = %address, "channel listening");
        self.listener = Some(listener);
        self.address = Some(address.clone());
        self.state = BackendState::Listening;
        Ok(address)
    }

    /// Accept the next peer. `None` waits forever.
    pub async fn accept(&self, timeout: Option<Duration>) -> ConnectionResult<Transport> {
        let listener = match (&self.state, &self.listener) {
            (BackendState::Listening, Some(listener)) => listener,
            _ => return Err(ConnectionError::InvalidState("listening")),
        };
        let accept = async {
            match listener {
                Listener::Unix(l) => l.accept().await.map(|(s, _)| Transport::Unix(s)),
                Listener::Tcp(l) => {
                    let (s, _) = l.accept().await?;
                    s.set_nodelay(true)?;
                    Ok(Transport::Tcp(s))
                }
            }
        };
        let transport = match timeout {
            Some(limit) => tokio::time::timeout(limit, accept)
                .await
                .map_err(|_| ConnectionError::AcceptTimeout(limit))??,
            None => accept.await?,
        };
        Ok(transport)
    }

    /// Stop listening and remove the socket file.
    pub fn close(&mut self) {
        self.listener = None;
        if let Some(Address::Local(path)) = &self.address {
            if self.state == BackendState::Listening {
                let _ = std::fs::remove_file(path);
            }
        }
        self.state = BackendState::Closed;
    }

    fn socket_path(&self) -> PathBuf {
        let dir = self
            .socket_dir
            .clone()
            .or_else(dirs::runtime_dir)
            .unwrap_or_else(std::env::temp_dir);
        socket_path_in(&dir)
    }
}

impl Drop for ChannelBackend {
    fn drop(&mut self) {
        if self.state == BackendState::Listening {
            self.close();
        }
    }
}

fn socket_path_in(dir: &Path) -> PathBuf {
    dir.join(format!("ioworker-{}.sock", uuid::Uuid::new_v4().simple()))
}
