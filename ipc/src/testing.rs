//! Scripted peers and fixtures for driving connections in tests.

use crate::connection::{self, ConnectionContext, ConnectionSettings, DeviceHandle};
use crate::handler::{RejectAll, RequestHandler};
use crate::registry::{DevMgr, DeviceEvent};
use crate::transport::{Direction, PendingTransport};
use ddx_core::device::{DeviceRoles, DisconnectReason, RegistrationParams, PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadBuf,
    ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;

pub(crate) fn settings() -> ConnectionSettings {
    ConnectionSettings {
        identity: RegistrationParams::new("test-daemon", DeviceRoles::DAEMON),
        registration_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        max_frame_size: 64 * 1024,
        require_encryption: false,
    }
}

pub(crate) fn context() -> (ConnectionContext, mpsc::UnboundedReceiver<DeviceEvent>) {
    context_with(Arc::new(RejectAll), settings())
}

pub(crate) fn context_with(
    requests: Arc<dyn RequestHandler>,
    settings: ConnectionSettings,
) -> (ConnectionContext, mpsc::UnboundedReceiver<DeviceEvent>) {
    let (registry, events) = DevMgr::new();
    (ConnectionContext::new(registry, requests, settings), events)
}

/// An inbound connection whose other end is driven by hand.
pub(crate) fn spawn_with_peer(ctx: &ConnectionContext) -> (DeviceHandle, RawPeer) {
    let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
    let device = connection::spawn(
        PendingTransport::from_stream(local, "pipe", Direction::Inbound),
        ctx,
    );
    (device, RawPeer::new(remote))
}

/// Two connections talking to each other through one registry: an outbound
/// client answering nothing and an inbound server feeding `server_requests`.
pub(crate) fn pair(
    server_requests: Arc<dyn RequestHandler>,
) -> (DeviceHandle, DeviceHandle, mpsc::UnboundedReceiver<DeviceEvent>) {
    let (registry, events) = DevMgr::new();
    let mut client_settings = settings();
    client_settings.identity = RegistrationParams::new("test-manager", DeviceRoles::MANAGER);
    let client_ctx = ConnectionContext::new(registry.clone(), Arc::new(RejectAll), client_settings);
    let server_ctx = ConnectionContext::new(registry, server_requests, settings());

    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    let client = connection::spawn(PendingTransport::from_stream(a, "pipe", Direction::Outbound), &client_ctx);
    let server = connection::spawn(PendingTransport::from_stream(b, "pipe", Direction::Inbound), &server_ctx);
    (client, server, events)
}

pub(crate) async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out waiting")
}

/// Skips events until the next disconnect.
pub(crate) async fn next_disconnect(
    events: &mut mpsc::UnboundedReceiver<DeviceEvent>,
) -> (DisconnectReason, bool) {
    within(async {
        loop {
            match events.recv().await {
                Some(DeviceEvent::Disconnected {
                    reason,
                    from_remote,
                    ..
                }) => return (reason, from_remote),
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
}

/// Polls until the connection has nothing outstanding.
pub(crate) async fn settled(device: &DeviceHandle) {
    within(async {
        while device.pending_requests().await != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// The far end of a pipe, speaking raw JSON lines.
pub(crate) struct RawPeer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl RawPeer {
    fn new(stream: DuplexStream) -> Self {
        let (read, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    pub(crate) async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub(crate) async fn send_json(&mut self, value: Value) {
        self.send_line(&value.to_string()).await;
    }

    pub(crate) async fn recv_json(&mut self) -> Value {
        let mut line = String::new();
        let read = within(self.reader.read_line(&mut line)).await.unwrap();
        assert!(read > 0, "connection closed the pipe");
        serde_json::from_str(&line).unwrap()
    }

    /// Completes both halves of the registration handshake as `cid`.
    pub(crate) async fn register(&mut self, cid: &str, roles: DeviceRoles) {
        let request = self.recv_json().await;
        assert_eq!(request["method"], "register");
        assert_eq!(request["params"]["protocol"], PROTOCOL_VERSION);
        self.send_json(json!({"id": request["id"].clone(), "result": true}))
            .await;

        self.send_json(json!({
            "method": "register",
            "id": "peer-reg",
            "params": {"cid": cid, "roles": roles.bits(), "protocol": PROTOCOL_VERSION}
        }))
        .await;
        assert_eq!(self.recv_json().await, json!({"id": "peer-reg", "result": true}));
    }
}

/// A stream that never yields data and fails every write with `kind`.
pub(crate) struct BrokenWrites(pub io::ErrorKind);

impl AsyncRead for BrokenWrites {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for BrokenWrites {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::from(self.0)))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::from(self.0)))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
