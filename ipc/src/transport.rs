//! Socket plumbing under a connection: establishment, line framing and the
//! writer task.

use ddx_core::codec::Frame;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

/// Any duplex byte stream a connection can run over.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> IoStream for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    Plain,
    Tls,
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encryption::Plain => f.write_str("plain"),
            Encryption::Tls => f.write_str("TLS"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub direction: Direction,
    pub encryption: Encryption,
    /// Printable peer address
    pub peer: String,
    /// Loopback peers are trusted without encryption
    pub is_local: bool,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Incoming line exceeds the {max} byte limit")]
    Overflow { max: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A stream that still needs its connect and/or TLS handshake.
pub enum PendingTransport {
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<TlsAcceptor>,
    },
    Connect {
        host: String,
        port: u16,
        tls: Option<(TlsConnector, ServerName<'static>)>,
    },
    /// Already usable, e.g. one end of an in-memory pipe
    Established {
        stream: Box<dyn IoStream>,
        info: TransportInfo,
    },
}

impl PendingTransport {
    pub fn accepted(stream: TcpStream, peer: SocketAddr, tls: Option<TlsAcceptor>) -> Self {
        PendingTransport::Accepted { stream, peer, tls }
    }

    pub fn connect(
        host: impl Into<String>,
        port: u16,
        tls: Option<(TlsConnector, ServerName<'static>)>,
    ) -> Self {
        PendingTransport::Connect {
            host: host.into(),
            port,
            tls,
        }
    }

    /// Wraps a stream that needs no handshake. It is treated as a plain local peer.
    pub fn from_stream<S: IoStream>(stream: S, peer: impl Into<String>, direction: Direction) -> Self {
        PendingTransport::Established {
            stream: Box::new(stream),
            info: TransportInfo {
                direction,
                encryption: Encryption::Plain,
                peer: peer.into(),
                is_local: true,
            },
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            PendingTransport::Accepted { .. } => Direction::Inbound,
            PendingTransport::Connect { .. } => Direction::Outbound,
            PendingTransport::Established { info, .. } => info.direction,
        }
    }

    /// Connects and handshakes as needed. Nothing is read from the peer here
    /// apart from handshake records.
    pub async fn establish(self) -> Result<Transport, TransportError> {
        match self {
            PendingTransport::Accepted { stream, peer, tls } => {
                configure_socket(&stream, peer);
                let is_local = peer.ip().is_loopback();
                let (stream, encryption): (Box<dyn IoStream>, _) = match tls {
                    Some(acceptor) => {
                        let stream = acceptor
                            .accept(stream)
                            .await
                            .map_err(TransportError::Handshake)?;
                        (Box::new(stream), Encryption::Tls)
                    }
                    None => (Box::new(stream), Encryption::Plain),
                };
                Ok(Transport {
                    stream,
                    info: TransportInfo {
                        direction: Direction::Inbound,
                        encryption,
                        peer: peer.to_string(),
                        is_local,
                    },
                })
            }
            PendingTransport::Connect { host, port, tls } => {
                let stream = TcpStream::connect((host.as_str(), port))
                    .await
                    .map_err(|source| TransportError::Connect {
                        target: format!("{}:{}", host, port),
                        source,
                    })?;
                let peer = stream.peer_addr()?;
                configure_socket(&stream, peer);
                let is_local = peer.ip().is_loopback();
                let (stream, encryption): (Box<dyn IoStream>, _) = match tls {
                    Some((connector, server_name)) => {
                        let stream = connector
                            .connect(server_name, stream)
                            .await
                            .map_err(TransportError::Handshake)?;
                        (Box::new(stream), Encryption::Tls)
                    }
                    None => (Box::new(stream), Encryption::Plain),
                };
                Ok(Transport {
                    stream,
                    info: TransportInfo {
                        direction: Direction::Outbound,
                        encryption,
                        peer: peer.to_string(),
                        is_local,
                    },
                })
            }
            PendingTransport::Established { stream, info } => Ok(Transport { stream, info }),
        }
    }
}

/// An established stream and what is known about it.
pub struct Transport {
    stream: Box<dyn IoStream>,
    info: TransportInfo,
}

impl Transport {
    pub fn info(&self) -> &TransportInfo {
        &self.info
    }

    pub fn into_split(
        self,
        max_frame_size: usize,
    ) -> (FrameReader<ReadHalf<Box<dyn IoStream>>>, WriteHalf<Box<dyn IoStream>>) {
        let (read, write) = tokio::io::split(self.stream);
        (FrameReader::new(read, max_frame_size), write)
    }
}

fn configure_socket(stream: &TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(peer = %peer, "Failed to set TCP_NODELAY: {}", e);
    }
    if !peer.ip().is_loopback() {
        if let Err(e) = socket2::SockRef::from(stream).set_keepalive(true) {
            warn!(peer = %peer, "Failed to enable keep-alive: {}", e);
        }
    }
}

/// Splits a byte stream into newline-terminated lines of bounded length.
///
/// A partially read line survives a cancelled `next_frame`, so the call can
/// sit in a `select!`.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    partial: Vec<u8>,
    max: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            partial: Vec::new(),
            max,
        }
    }

    /// Next line including its terminator, or `None` at end of stream.
    /// An unterminated tail at end of stream is discarded.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            let (used, complete) = {
                let available = self.inner.fill_buf().await?;
                if available.is_empty() {
                    if !self.partial.is_empty() {
                        debug!("Discarding {} unterminated bytes at end of stream", self.partial.len());
                        self.partial.clear();
                    }
                    return Ok(None);
                }
                match available.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        if self.partial.len() + pos + 1 > self.max {
                            return Err(FrameError::Overflow { max: self.max });
                        }
                        self.partial.extend_from_slice(&available[..=pos]);
                        (pos + 1, true)
                    }
                    None => {
                        if self.partial.len() + available.len() > self.max {
                            return Err(FrameError::Overflow { max: self.max });
                        }
                        self.partial.extend_from_slice(available);
                        (available.len(), false)
                    }
                }
            };
            self.inner.consume(used);
            if complete {
                return Ok(Some(std::mem::take(&mut self.partial)));
            }
        }
    }
}

/// The writer task and its two ends.
pub(crate) struct Writer {
    /// Frames to write, in order; dropping it flushes and shuts the stream down
    pub frames: mpsc::UnboundedSender<Frame>,
    /// Resolves with the error that stopped the task, if one did
    pub failed: oneshot::Receiver<io::Error>,
    pub task: JoinHandle<()>,
}

/// Starts the task that owns the write half.
pub(crate) fn spawn_writer<W>(writer: W, cid: String) -> Writer
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (frames, rx) = mpsc::unbounded_channel();
    let (failed_tx, failed) = oneshot::channel();
    let task = tokio::spawn(drain_frames(rx, writer, failed_tx, cid));
    Writer {
        frames,
        failed,
        task,
    }
}

async fn drain_frames<W: AsyncWrite + Unpin>(
    mut rx: mpsc::UnboundedReceiver<Frame>,
    writer: W,
    failed: oneshot::Sender<io::Error>,
    cid: String,
) {
    let mut writer = BufWriter::new(writer);
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_batch(&mut writer, frame, &mut rx).await {
            debug!(cid = %cid, "Writer stopped: {}", e);
            let _ = failed.send(e);
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(cid = %cid, "Stream shutdown failed: {}", e);
    }
}

/// Writes `first` plus whatever else is already queued, then flushes once.
async fn write_batch<W: AsyncWrite + Unpin>(
    writer: &mut BufWriter<W>,
    first: Frame,
    rx: &mut mpsc::UnboundedReceiver<Frame>,
) -> io::Result<()> {
    writer.write_all(first.as_bytes()).await?;
    while let Ok(frame) = rx.try_recv() {
        writer.write_all(frame.as_bytes()).await?;
    }
    writer.flush().await
}

/// Error kinds that just mean the peer is gone.
pub fn is_remote_closed(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
