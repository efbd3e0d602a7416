//! Transport: connected duplex streams from inbound accepts and outbound dials.
//! The TCP implementation exchanges a short hello carrying each side's display name.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Hello version byte; bumped if the hello layout changes.
pub const HANDSHAKE_VERSION: u8 = 1;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Any reliable ordered duplex byte stream.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// An established connection to one peer.
pub struct Connection {
    /// Identity key of the peer; unique within the registry.
    pub address: String,
    /// Display name the peer announced.
    pub name: String,
    pub stream: Box<dyn PeerStream>,
}

impl Connection {
    pub fn new(
        address: impl Into<String>,
        name: impl Into<String>,
        stream: impl PeerStream + 'static,
    ) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            stream: Box::new(stream),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Source of inbound connections. Dropping it stops accepting.
#[async_trait]
pub trait Listener: Send + 'static {
    /// Block until the next inbound connection. An error ends the accept loop.
    async fn accept(&mut self) -> io::Result<Connection>;
}

/// Factory for connections: a listener for inbound peers, a dial for outbound ones.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Listener: Listener;

    async fn listen(&self) -> io::Result<Self::Listener>;

    async fn dial(&self, target: &str) -> io::Result<Connection>;

    /// Stop discovery or advertising that would slow a dial down.
    fn cancel_discovery(&self) {}
}

/// TCP transport. `target` for dials is `host:port`.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    bind: SocketAddr,
    local_name: String,
}

impl TcpTransport {
    pub fn new(bind: SocketAddr, local_name: impl Into<String>) -> Self {
        Self {
            bind,
            local_name: local_name.into(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Listener = TcpPeerListener;

    async fn listen(&self) -> io::Result<TcpPeerListener> {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let listener = TcpPeerListener {
            listener: TcpListener::bind(self.bind).await?,
            local_name: self.local_name.clone(),
            ready_tx,
            ready_rx,
        };
        debug!(addr = %listener.local_addr()?, "tcp listener bound");
        Ok(listener)
    }

    async fn dial(&self, target: &str) -> io::Result<Connection> {
        let mut stream = TcpStream::connect(target).await?;
        stream.set_nodelay(true)?;
        let address = stream.peer_addr()?.to_string();
        let name = timed_handshake(&mut stream, &self.local_name).await?;
        Ok(Connection::new(address, name, stream))
    }
}

/// Bound TCP listener. Each accepted socket does its hello in its own task, so a
/// silent client cannot hold up the ones behind it. A peer that fails the hello
/// is dropped.
pub struct TcpPeerListener {
    listener: TcpListener,
    local_name: String,
    ready_tx: mpsc::UnboundedSender<Connection>,
    ready_rx: mpsc::UnboundedReceiver<Connection>,
}

impl TcpPeerListener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn spawn_handshake(&self, mut stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = %e, "set_nodelay failed");
        }
        let local_name = self.local_name.clone();
        let ready = self.ready_tx.clone();
        tokio::spawn(async move {
            match timed_handshake(&mut stream, &local_name).await {
                // Send fails only once the listener is gone; the stream drops with it.
                Ok(name) => {
                    let _ = ready.send(Connection::new(addr.to_string(), name, stream));
                }
                Err(e) => warn!(peer = %addr, error = %e, "inbound handshake failed"),
            }
        });
    }
}

#[async_trait]
impl Listener for TcpPeerListener {
    async fn accept(&mut self) -> io::Result<Connection> {
        loop {
            tokio::select! {
                Some(conn) = self.ready_rx.recv() => return Ok(conn),
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    self.spawn_handshake(stream, addr);
                }
            }
        }
    }
}

async fn timed_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local_name: &str,
) -> io::Result<String> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(stream, local_name))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))?
}

/// Both sides write their hello, then read the other's: version, name length, name.
async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local_name: &str,
) -> io::Result<String> {
    stream.write_all(&hello_bytes(local_name)).await?;
    stream.flush().await?;
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != HANDSHAKE_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported handshake version",
        ));
    }
    let mut name = vec![0u8; head[1] as usize];
    stream.read_exact(&mut name).await?;
    Ok(String::from_utf8_lossy(&name).into_owned())
}

fn hello_bytes(name: &str) -> Vec<u8> {
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = Vec::with_capacity(2 + end);
    out.push(HANDSHAKE_VERSION);
    out.push(end as u8);
    out.extend_from_slice(&name.as_bytes()[..end]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_exchanges_names() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let (ra, rb) = tokio::join!(handshake(&mut a, "alice"), handshake(&mut b, "bob"));
        assert_eq!(ra.unwrap(), "bob");
        assert_eq!(rb.unwrap(), "alice");
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_version() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        b.write_all(&[HANDSHAKE_VERSION + 1, 0]).await.unwrap();
        let err = handshake(&mut a, "alice").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn long_names_are_truncated_on_char_boundary() {
        let name = "é".repeat(200);
        let hello = hello_bytes(&name);
        let len = hello[1] as usize;
        assert!(len <= MAX_NAME_LEN);
        assert_eq!(hello.len(), 2 + len);
        assert!(std::str::from_utf8(&hello[2..]).is_ok());
    }

    #[tokio::test]
    async fn tcp_dial_and_accept() {
        let server = TcpTransport::new("127.0.0.1:0".parse().unwrap(), "server");
        let mut listener = server.listen().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpTransport::new("127.0.0.1:0".parse().unwrap(), "client");
        let target = addr.to_string();
        let (accepted, dialed) = tokio::join!(listener.accept(), client.dial(&target));
        let accepted = accepted.unwrap();
        let dialed = dialed.unwrap();
        assert_eq!(accepted.name, "client");
        assert_eq!(dialed.name, "server");
        assert_eq!(dialed.address, target);
    }

    #[tokio::test]
    async fn idle_client_does_not_block_other_accepts() {
        let server = TcpTransport::new("127.0.0.1:0".parse().unwrap(), "server");
        let mut listener = server.listen().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _idle_a = TcpStream::connect(addr).await.unwrap();
        let _idle_b = TcpStream::connect(addr).await.unwrap();

        let client = TcpTransport::new("127.0.0.1:0".parse().unwrap(), "client");
        let target = addr.to_string();
        let (accepted, dialed) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(listener.accept(), client.dial(&target))
        })
        .await
        .expect("dial stalled behind idle clients");
        assert_eq!(accepted.unwrap().name, "client");
        assert_eq!(dialed.unwrap().name, "server");
    }
}
