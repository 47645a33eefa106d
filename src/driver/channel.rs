use std::{
    fmt,
    fs::Permissions,
    io::{self, Error, ErrorKind},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
};
use tracing::{debug, warn};

use crate::address::{SocketEndpoint, SocketKind};

use super::DriverEvent;

pub(crate) type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Identifies one of the two channels an endpoint driver carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Control,
    Data,
}

impl Channel {
    pub(crate) fn event(self, chunk: bytes::Bytes) -> DriverEvent {
        match self {
            Self::Control => DriverEvent::Control(chunk),
            Self::Data => DriverEvent::Data(chunk),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => f.write_str("control"),
            Self::Data => f.write_str("data"),
        }
    }
}

/// An established connection, split into halves that can be owned by different tasks.
pub(crate) struct SplitStream {
    pub reader: ChannelReader,
    pub writer: ChannelWriter,
}

impl SplitStream {
    fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

fn not_tcp_address(endpoint: &SocketEndpoint) -> Error {
    Error::new(ErrorKind::InvalidInput, format!("{endpoint} does not hold an IP address"))
}

/// Opens a client connection to an endpoint.
pub(crate) async fn connect_stream(endpoint: &SocketEndpoint) -> io::Result<SplitStream> {
    match endpoint.kind {
        SocketKind::Tcp => {
            let address = endpoint.socket_addr().ok_or_else(|| not_tcp_address(endpoint))?;
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok(SplitStream::new(reader, writer))
        }
        SocketKind::Unix => {
            let stream = UnixStream::connect(&endpoint.address).await?;
            let (reader, writer) = stream.into_split();
            Ok(SplitStream::new(reader, writer))
        }
    }
}

/// A bound listening socket. Dropping a unix listener removes its socket file.
pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Binds a listener at an endpoint. For unix endpoints, a file already present at the path is
    /// removed first, and the endpoint's mode (if any) is applied to the new socket file.
    pub async fn bind(endpoint: &SocketEndpoint) -> io::Result<Self> {
        match endpoint.kind {
            SocketKind::Tcp => {
                let address = endpoint.socket_addr().ok_or_else(|| not_tcp_address(endpoint))?;
                Ok(Self::Tcp(TcpListener::bind(address).await?))
            }
            SocketKind::Unix => {
                let path = PathBuf::from(&endpoint.address);
                remove_stale_socket(&path)?;
                let bound = Self::Unix {
                    listener: UnixListener::bind(&path)?,
                    path: path.clone(),
                };

                if let Some(mode) = endpoint.mode {
                    std::fs::set_permissions(&path, Permissions::from_mode(mode))?;
                }

                Ok(bound)
            }
        }
    }

    /// The endpoint this listener is actually bound at, with ephemeral ports resolved.
    pub fn local_endpoint(&self) -> io::Result<SocketEndpoint> {
        match self {
            Self::Tcp(listener) => {
                let address = listener.local_addr()?;
                Ok(SocketEndpoint::tcp(address.ip(), address.port()))
            }
            Self::Unix { path, .. } => Ok(SocketEndpoint::unix(path)),
        }
    }

    /// Accepts a single incoming connection, returning it along with a printable peer address.
    pub async fn accept(&self) -> io::Result<(SplitStream, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, from) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((SplitStream::new(reader, writer), from.to_string()))
            }
            Self::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok((SplitStream::new(reader, writer), path.display().to_string()))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            if let Err(error) = std::fs::remove_file(&*path) {
                if error.kind() != ErrorKind::NotFound {
                    warn!("Could not remove socket file {}: {error}", path.display());
                }
            }
        }
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed stale socket file {}", path.display());
            Ok(())
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}
