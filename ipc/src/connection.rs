//! One peer connection: registration handshake, request correlation, timeouts
//! and teardown.
//!
//! Each connection runs as its own task. [`DeviceHandle`] is the cloneable
//! front end; every call on it is an enqueue onto the task's command queue, so
//! handles can be used from any task or thread.

use crate::correlation::{CorrelationTable, IdAllocator, LocalId, PendingRequest, ResponseTarget};
use crate::handler::{Request, RequestHandler, Response, ResponseHandler};
use crate::registry::{DevMgr, DeviceEvent};
use crate::transport::{self, Direction, Encryption, FrameError, PendingTransport, Transport};
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use ddx_core::codec::{self, CodecError, Frame};
use ddx_core::config::DdxConfig;
use ddx_core::device::{
    DeviceRoles, DisconnectParams, DisconnectReason, RegistrationParams, DISCONNECT_METHOD,
    REGISTER_METHOD,
};
use ddx_core::rpc_types::{ErrorCode, Message, RpcError};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Registry key of a connection.
pub type DeviceId = u64;

const CLOSED_MESSAGE: &str = "Connection closed before a response arrived";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct RegistrationState: u8 {
        /// Our `register` request is on the wire
        const REG_SENT = 0x1;
        /// We accepted the peer's `register` request
        const REG_ACCEPTED = 0x2;
        /// The peer accepted our `register` request
        const REMOTE_REG_ACCEPTED = 0x4;
        const REGISTERED = Self::REG_SENT.bits()
            | Self::REG_ACCEPTED.bits()
            | Self::REMOTE_REG_ACCEPTED.bits();
    }
}

/// Per-connection settings, shared by every connection a host creates.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// What we assert in our own `register` request
    pub identity: RegistrationParams,
    pub registration_timeout: Duration,
    /// Default for `send_request`; zero disables it
    pub request_timeout: Duration,
    pub max_frame_size: usize,
    pub require_encryption: bool,
}

impl ConnectionSettings {
    pub fn from_config(config: &DdxConfig) -> Self {
        let mut identity = RegistrationParams::new(config.device.name.clone(), config.device.roles);
        identity.locale = config.device.locale.clone();
        Self {
            identity,
            registration_timeout: config.network.registration_timeout(),
            request_timeout: config.network.request_timeout(),
            max_frame_size: config.network.max_frame_size,
            require_encryption: config.network.require_encryption,
        }
    }
}

/// Everything a new connection is wired into.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<DevMgr>,
    pub requests: Arc<dyn RequestHandler>,
    pub settings: Arc<ConnectionSettings>,
}

impl ConnectionContext {
    pub fn new(
        registry: Arc<DevMgr>,
        requests: Arc<dyn RequestHandler>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            registry,
            requests,
            settings: Arc::new(settings),
        }
    }
}

pub(crate) enum Command {
    Request {
        id: LocalId,
        target: ResponseTarget,
        method: String,
        params: Option<Value>,
        /// `None` selects the configured default
        timeout: Option<Duration>,
    },
    /// Responses and notifications
    Send(Message),
    TimeoutPoll,
    Close {
        reason: DisconnectReason,
        from_remote: bool,
    },
    PendingCount(oneshot::Sender<usize>),
}

struct Shared {
    id: DeviceId,
    cid: RwLock<String>,
    closing: AtomicBool,
    registered: AtomicBool,
    remote_roles: AtomicU8,
    encrypted: AtomicBool,
    direction: Direction,
    ids: IdAllocator,
    connect_time: DateTime<Utc>,
}

/// Point-in-time view of a connection, as reported by `listDevices`.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub cid: String,
    pub registered: bool,
    pub inbound: bool,
    pub encrypted: bool,
    /// Raw role bits, as asserted in `register`
    pub roles: u8,
    pub connected_since: DateTime<Utc>,
}

/// Cloneable handle to a running connection.
#[derive(Clone)]
pub struct DeviceHandle {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Command>,
    finished: watch::Receiver<bool>,
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.shared.id)
            .field("cid", &self.cid())
            .finish()
    }
}

impl DeviceHandle {
    pub fn id(&self) -> DeviceId {
        self.shared.id
    }

    /// Provisional name until registration, then the peer's asserted cid.
    pub fn cid(&self) -> String {
        self.shared
            .cid
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_cid(&self, cid: &str) {
        *self.shared.cid.write().unwrap_or_else(PoisonError::into_inner) = cid.to_string();
    }

    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    pub fn is_inbound(&self) -> bool {
        self.shared.direction == Direction::Inbound
    }

    pub fn is_encrypted(&self) -> bool {
        self.shared.encrypted.load(Ordering::Acquire)
    }

    /// Roles the peer asserted; empty before registration.
    pub fn remote_roles(&self) -> DeviceRoles {
        DeviceRoles::from_bits_truncate(self.shared.remote_roles.load(Ordering::Acquire))
    }

    pub fn connect_time(&self) -> DateTime<Utc> {
        self.shared.connect_time
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            id: self.id(),
            cid: self.cid(),
            registered: self.is_registered(),
            inbound: self.is_inbound(),
            encrypted: self.is_encrypted(),
            roles: self.remote_roles().bits(),
            connected_since: self.connect_time(),
        }
    }

    fn enqueue(&self, command: Command) -> bool {
        if self.is_closing() {
            return false;
        }
        self.tx.send(command).is_ok()
    }

    /// Sends a request with the default timeout. The response goes to
    /// `handler`, which is not kept alive by the connection.
    ///
    /// Returns `None` if the connection is closing.
    pub fn send_request<H: ResponseHandler>(
        &self,
        handler: &Arc<H>,
        method: &str,
        params: Option<Value>,
    ) -> Option<LocalId> {
        self.issue(handler, method, params, None)
    }

    /// Like [`send_request`](Self::send_request); `Duration::ZERO` never times out.
    pub fn send_request_with_timeout<H: ResponseHandler>(
        &self,
        handler: &Arc<H>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Option<LocalId> {
        self.issue(handler, method, params, Some(timeout))
    }

    fn issue<H: ResponseHandler>(
        &self,
        handler: &Arc<H>,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Option<LocalId> {
        if self.is_closing() {
            return None;
        }
        let weak: Weak<dyn ResponseHandler> = Arc::downgrade(handler) as Weak<dyn ResponseHandler>;
        let id = self.shared.ids.next_id();
        let sent = self.enqueue(Command::Request {
            id,
            target: ResponseTarget::Handler(weak),
            method: method.to_string(),
            params,
            timeout,
        });
        sent.then_some(id)
    }

    /// Answers `request` on the connection it arrived on. `None` sends `true`.
    /// Notifications are consumed without writing anything.
    pub fn send_response(&self, request: Request, result: Option<Value>) {
        let device = request.device.clone();
        let method = request.method.clone();
        match request.into_id() {
            Some(id) => {
                device.enqueue(Command::Send(Message::response(id, result)));
            }
            None => debug!(cid = %self.cid(), method = %method, "Not answering a notification"),
        }
    }

    pub fn send_error(
        &self,
        request: Request,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) {
        let device = request.device.clone();
        let method = request.method.clone();
        match request.into_id() {
            Some(id) => {
                let error = RpcError::new(code, message, data);
                device.enqueue(Command::Send(Message::error(id, error)));
            }
            None => debug!(cid = %self.cid(), method = %method, "Not answering a notification"),
        }
    }

    pub fn send_error_code(&self, request: Request, code: ErrorCode) {
        self.send_error(request, code.code(), code.message(), None);
    }

    pub fn send_notification(&self, method: &str, params: Option<Value>) {
        self.enqueue(Command::Send(Message::notification(method, params)));
    }

    /// Asks the connection to expire overdue requests and check its
    /// registration deadline.
    pub fn timeout_poll(&self) {
        self.enqueue(Command::TimeoutPoll);
    }

    /// Closes the connection. Only the first call has any effect.
    pub fn close(&self, reason: DisconnectReason, from_remote: bool) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Command::Close {
            reason,
            from_remote,
        });
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_requests(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::PendingCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Resolves once the connection task has finished.
    pub async fn closed(&self) {
        let mut finished = self.finished.clone();
        let _ = finished.wait_for(|done| *done).await;
    }
}

/// Creates a connection over `pending`, adds it to the registry and starts
/// its task.
pub fn spawn(pending: PendingTransport, ctx: &ConnectionContext) -> DeviceHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (finished_tx, finished_rx) = watch::channel(false);
    let shared = Arc::new(Shared {
        id: ctx.registry.next_device_id(),
        cid: RwLock::new(String::new()),
        closing: AtomicBool::new(false),
        registered: AtomicBool::new(false),
        remote_roles: AtomicU8::new(0),
        encrypted: AtomicBool::new(false),
        direction: pending.direction(),
        ids: IdAllocator::new(),
        connect_time: Utc::now(),
    });
    let handle = DeviceHandle {
        shared,
        tx,
        finished: finished_rx,
    };
    ctx.registry.add_device(handle.clone());

    let connection = Connection {
        handle: handle.clone(),
        ctx: ctx.clone(),
        reqs: CorrelationTable::default(),
        reg_state: RegistrationState::empty(),
        reg_deadline: Instant::now() + ctx.settings.registration_timeout,
        writer: None,
        writer_task: None,
        held: Vec::new(),
        closed: false,
    };
    tokio::spawn(connection.run(rx, pending, finished_tx));
    handle
}

struct Connection {
    handle: DeviceHandle,
    ctx: ConnectionContext,
    reqs: CorrelationTable,
    reg_state: RegistrationState,
    reg_deadline: Instant,
    writer: Option<mpsc::UnboundedSender<Frame>>,
    writer_task: Option<JoinHandle<()>>,
    /// Outgoing traffic queued until registration completes, with the
    /// request id for requests
    held: Vec<(Option<LocalId>, Frame)>,
    closed: bool,
}

impl Connection {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        pending: PendingTransport,
        finished: watch::Sender<bool>,
    ) {
        let establish = tokio::time::timeout(self.ctx.settings.registration_timeout, pending.establish());
        tokio::pin!(establish);
        let transport = loop {
            tokio::select! {
                biased;
                established = &mut establish => match established {
                    Ok(Ok(transport)) => break Some(transport),
                    Ok(Err(e)) => {
                        self.log(format!("Could not establish connection: {}", e), true);
                        self.close(DisconnectReason::FatalError, false);
                        break None;
                    }
                    Err(_) => {
                        self.log("Connection was not established in time", true);
                        self.close(DisconnectReason::RegistrationTimeout, false);
                        break None;
                    }
                },
                Some(command) = rx.recv() => {
                    self.handle_command(command);
                    if self.closed {
                        break None;
                    }
                }
            }
        };

        if let Some(transport) = transport {
            self.serve(transport, &mut rx).await;
        }
        self.drain_commands(&mut rx);

        if let Some(task) = self.writer_task.take() {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                debug!(cid = %self.handle.cid(), "Writer did not finish flushing");
            }
        }
        let _ = finished.send(true);
    }

    async fn serve(&mut self, transport: Transport, rx: &mut mpsc::UnboundedReceiver<Command>) {
        let info = transport.info().clone();
        let encrypted = info.encryption == Encryption::Tls;
        self.handle.shared.encrypted.store(encrypted, Ordering::Release);
        let direction = match info.direction {
            Direction::Inbound => "from",
            Direction::Outbound => "to",
        };
        self.log(
            format!("Connected {} {} ({})", direction, info.peer, info.encryption),
            false,
        );

        let (mut reader, write_half) = transport.into_split(self.ctx.settings.max_frame_size);
        let writer = transport::spawn_writer(write_half, self.handle.cid());
        let mut write_failed = writer.failed;
        self.writer = Some(writer.frames);
        self.writer_task = Some(writer.task);

        if self.ctx.settings.require_encryption && !encrypted && !info.is_local {
            self.log(format!("Refusing unencrypted connection from {}", info.peer), true);
            self.close(DisconnectReason::EncryptionRequired, false);
            return;
        }

        self.send_registration();
        while !self.closed {
            tokio::select! {
                Some(command) = rx.recv() => self.handle_command(command),
                read = reader.next_frame() => self.handle_read(read),
                failure = &mut write_failed => self.handle_write_failure(failure.ok()),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Request {
                id,
                target,
                method,
                params,
                timeout,
            } => {
                let timeout = timeout.unwrap_or(self.ctx.settings.request_timeout);
                self.reqs
                    .insert(id, PendingRequest::new(target, method.clone(), Some(timeout)));
                self.send_gated(Message::request(id, method, params), Some(id));
            }
            Command::Send(message) => self.send_gated(message, None),
            Command::TimeoutPoll => self.timeout_poll(),
            Command::Close {
                reason,
                from_remote,
            } => self.close(reason, from_remote),
            Command::PendingCount(reply) => {
                let _ = reply.send(self.reqs.len());
            }
        }
    }

    /// Commands that were queued behind the close. Requests among them still
    /// get an answer so nobody waits forever.
    fn drain_commands(&mut self, rx: &mut mpsc::UnboundedReceiver<Command>) {
        rx.close();
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Request {
                    id,
                    target: ResponseTarget::Handler(handler),
                    method,
                    ..
                } => self.deliver(
                    handler,
                    id,
                    method,
                    Err(RpcError::new(ErrorCode::RequestTimedOut.code(), CLOSED_MESSAGE, None)),
                ),
                Command::PendingCount(reply) => {
                    let _ = reply.send(0);
                }
                _ => {}
            }
        }
    }

    fn is_registered(&self) -> bool {
        self.reg_state.contains(RegistrationState::REGISTERED)
    }

    fn handle_read(&mut self, read: Result<Option<Vec<u8>>, FrameError>) {
        match read {
            Ok(Some(line)) => self.handle_line(&line),
            Ok(None) => {
                self.log("Remote host closed the connection", false);
                self.close(DisconnectReason::UnknownReason, true);
            }
            Err(FrameError::Overflow { max }) => {
                self.log(format!("Peer sent a message over {} bytes", max), true);
                self.close(DisconnectReason::BufferOverflow, false);
            }
            Err(FrameError::Io(e)) if transport::is_remote_closed(&e) => {
                self.log(format!("Remote host closed the connection: {}", e), false);
                self.close(DisconnectReason::UnknownReason, true);
            }
            Err(FrameError::Io(e)) => {
                self.log(format!("Unhandled network error: {}", e), true);
                self.close(DisconnectReason::StreamClosed, false);
            }
        }
    }

    /// The writer task stopped; `None` means it ended without an error.
    fn handle_write_failure(&mut self, error: Option<std::io::Error>) {
        match error {
            Some(e) if transport::is_remote_closed(&e) => {
                self.log(format!("Remote host closed the connection: {}", e), false);
                self.close(DisconnectReason::UnknownReason, true);
            }
            Some(e) => {
                self.log(format!("Unhandled network error while writing: {}", e), true);
                self.close(DisconnectReason::StreamClosed, false);
            }
            None => {
                self.log("Writer stopped unexpectedly", true);
                self.close(DisconnectReason::StreamClosed, false);
            }
        }
    }

    fn handle_line(&mut self, line: &[u8]) {
        match codec::decode(line, self.ctx.settings.max_frame_size) {
            Ok(message) => self.handle_message(message),
            Err(CodecError::Empty) => {}
            Err(CodecError::Oversized { size, max }) => {
                self.log(format!("Peer sent a {} byte message (limit {})", size, max), true);
                self.close(DisconnectReason::BufferOverflow, false);
            }
            Err(e) => {
                self.log(format!("Protocol error: {}", e), true);
                self.close(DisconnectReason::ConnectionTerminated, false);
            }
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Request { id, method, params } => self.handle_incoming(Some(id), method, params),
            Message::Notification { method, params } => self.handle_incoming(None, method, params),
            Message::Response { id, result } => self.handle_response(id, Ok(result)),
            Message::Error { id, error } => self.handle_response(id, Err(error)),
        }
    }

    fn handle_incoming(&mut self, id: Option<Value>, method: String, params: Option<Value>) {
        if method == REGISTER_METHOD {
            self.handle_registration(id, params);
            return;
        }
        if method == DISCONNECT_METHOD {
            self.handle_disconnect(params);
            return;
        }
        if !self.is_registered() {
            self.log(format!("Received '{}' before registration", method), true);
            self.close(DisconnectReason::ConnectionTerminated, false);
            return;
        }
        let request = Request::new(method, params, id, self.handle.clone());
        self.ctx.requests.on_request(request);
    }

    fn handle_registration(&mut self, id: Option<Value>, params: Option<Value>) {
        let Some(id) = id else {
            self.log("Registration sent as a notification", true);
            self.close(DisconnectReason::ConnectionTerminated, false);
            return;
        };
        if self.reg_state.contains(RegistrationState::REG_ACCEPTED) {
            let code = ErrorCode::NotSupported;
            self.write_message(Message::error(
                id,
                RpcError::new(code.code(), "Already registered", None),
            ));
            return;
        }

        let parsed = params
            .ok_or_else(|| "missing params".to_string())
            .and_then(|p| serde_json::from_value::<RegistrationParams>(p).map_err(|e| e.to_string()))
            .and_then(|reg| reg.validate().map(|_| reg));
        let reg = match parsed {
            Ok(reg) => reg,
            Err(reason) => {
                self.log(format!("Rejected registration: {}", reason), true);
                let code = ErrorCode::InvalidParams.code();
                self.write_message(Message::error(id, RpcError::new(code, reason, None)));
                return;
            }
        };

        let provisional = self.handle.cid();
        self.handle.set_cid(&reg.cid);
        self.handle
            .shared
            .remote_roles
            .store(reg.roles().bits(), Ordering::Release);
        self.log(
            format!("{} identified as {} (roles {:?})", provisional, reg.cid, reg.roles()),
            false,
        );
        self.reg_state |= RegistrationState::REG_ACCEPTED;
        self.write_message(Message::response(id, None));
        self.check_registered();
    }

    fn handle_disconnect(&mut self, params: Option<Value>) {
        let reason = params
            .and_then(|p| serde_json::from_value::<DisconnectParams>(p).ok())
            .map(|p| p.reason)
            .unwrap_or(DisconnectReason::UnknownReason);
        self.log(format!("Remote disconnected: {}", reason), false);
        self.close(reason, true);
    }

    fn handle_response(&mut self, id: Value, outcome: Result<Value, RpcError>) {
        let Some(local_id) = id.as_u64() else {
            match outcome {
                Err(error) => self.log(format!("Peer reported an error: {}", error), true),
                Ok(_) => self.log(format!("Discarding response with foreign id {}", id), false),
            }
            return;
        };
        let Some(pending) = self.reqs.take(local_id) else {
            self.log(
                format!("Discarding response to unknown or expired request {}", local_id),
                false,
            );
            return;
        };

        match pending.target {
            ResponseTarget::Registration => match outcome {
                Ok(_) => {
                    self.reg_state |= RegistrationState::REMOTE_REG_ACCEPTED;
                    self.check_registered();
                }
                Err(error) => {
                    self.log(format!("Peer rejected registration: {}", error), true);
                    self.close(DisconnectReason::ConnectionTerminated, false);
                }
            },
            ResponseTarget::Handler(handler) => {
                if let Err(error) = &outcome {
                    self.log(format!("Request '{}' failed: {}", pending.method, error), false);
                }
                self.deliver(handler, local_id, pending.method, outcome);
            }
        }
    }

    fn deliver(
        &self,
        handler: Weak<dyn ResponseHandler>,
        id: LocalId,
        method: String,
        outcome: Result<Value, RpcError>,
    ) {
        let Some(handler) = handler.upgrade() else {
            debug!(cid = %self.handle.cid(), "Handler for request {} ({}) is gone", id, method);
            return;
        };
        let (successful, main_val) = match outcome {
            Ok(result) => (true, result),
            Err(error) => (false, error.to_value()),
        };
        handler.on_response(Response {
            successful,
            id,
            main_val,
            method,
            device: self.handle.clone(),
        });
    }

    fn send_registration(&mut self) {
        let params = match serde_json::to_value(&self.ctx.settings.identity) {
            Ok(params) => params,
            Err(e) => {
                self.log(format!("Could not encode registration: {}", e), true);
                self.close(DisconnectReason::FatalError, false);
                return;
            }
        };
        let id = self.handle.shared.ids.next_id();
        self.reqs.insert(
            id,
            PendingRequest::new(
                ResponseTarget::Registration,
                REGISTER_METHOD.to_string(),
                Some(self.ctx.settings.registration_timeout),
            ),
        );
        self.write_message(Message::request(id, REGISTER_METHOD, Some(params)));
        self.reg_state |= RegistrationState::REG_SENT;
    }

    fn check_registered(&mut self) {
        if !self.is_registered() || self.handle.shared.registered.swap(true, Ordering::AcqRel) {
            return;
        }
        self.log(format!("Registered with {}", self.handle.cid()), false);
        for (request, frame) in std::mem::take(&mut self.held) {
            // Requests that expired or lost their handler while held were
            // already answered locally.
            if let Some(id) = request {
                if !self.reqs.contains(id) {
                    debug!(cid = %self.handle.cid(), "Dropping held request {}", id);
                    continue;
                }
            }
            self.write_frame(frame);
        }
        self.ctx.registry.emit(DeviceEvent::Registered {
            device: self.handle.clone(),
        });
    }

    fn timeout_poll(&mut self) {
        let now = Instant::now();
        let sweep = self.reqs.sweep(now);
        for (id, pending) in sweep.expired {
            let waited = now.saturating_duration_since(pending.issued_at);
            match pending.target {
                ResponseTarget::Registration => {
                    self.log(format!("Registration request timed out after {:?}", waited), true);
                    self.close(DisconnectReason::RegistrationTimeout, false);
                }
                ResponseTarget::Handler(handler) => {
                    self.log(
                        format!("Request {} ({}) timed out after {:?}", id, pending.method, waited),
                        false,
                    );
                    self.deliver(handler, id, pending.method, Err(RpcError::from_code(ErrorCode::RequestTimedOut)));
                }
            }
        }
        if sweep.abandoned > 0 {
            debug!(cid = %self.handle.cid(), "Pruned {} request(s) with no handler", sweep.abandoned);
        }
        if !self.closed && !self.is_registered() && now >= self.reg_deadline {
            self.log("Peer did not register in time", true);
            self.close(DisconnectReason::RegistrationTimeout, false);
        }
    }

    fn close(&mut self, reason: DisconnectReason, from_remote: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.handle.shared.closing.store(true, Ordering::Release);
        let origin = if from_remote { "remote" } else { "local" };
        self.log(format!("Closing connection ({}, {})", reason, origin), false);

        if !from_remote {
            let notice = serde_json::to_value(DisconnectParams { reason }).ok();
            self.write_message(Message::notification(DISCONNECT_METHOD, notice));
        }
        for (id, pending) in self.reqs.drain() {
            if let ResponseTarget::Handler(handler) = pending.target {
                let error = RpcError::new(ErrorCode::RequestTimedOut.code(), CLOSED_MESSAGE, None);
                self.deliver(handler, id, pending.method, Err(error));
            }
        }
        self.held.clear();
        self.writer = None;

        self.ctx.registry.remove_device(self.handle.id());
        self.ctx.registry.emit(DeviceEvent::Disconnected {
            device: self.handle.clone(),
            reason,
            from_remote,
        });
    }

    fn send_gated(&mut self, message: Message, request: Option<LocalId>) {
        let Some(frame) = self.encode(&message) else {
            return;
        };
        if self.is_registered() {
            self.write_frame(frame);
        } else {
            self.held.push((request, frame));
        }
    }

    /// Bypasses the registration gate.
    fn write_message(&mut self, message: Message) {
        if let Some(frame) = self.encode(&message) {
            self.write_frame(frame);
        }
    }

    fn encode(&self, message: &Message) -> Option<Frame> {
        match codec::encode(message) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(cid = %self.handle.cid(), "Failed to encode outgoing message: {}", e);
                None
            }
        }
    }

    fn write_frame(&mut self, frame: Frame) {
        match &self.writer {
            Some(writer) => {
                if writer.send(frame).is_err() {
                    debug!(cid = %self.handle.cid(), "Writer is gone; dropping frame");
                }
            }
            None => debug!(cid = %self.handle.cid(), "No stream yet; dropping frame"),
        }
    }

    fn log(&self, message: impl Into<String>, alert: bool) {
        let message = message.into();
        let cid = self.handle.cid();
        if alert {
            warn!(cid = %cid, "{}", message);
        } else {
            info!(cid = %cid, "{}", message);
        }
        self.ctx.registry.emit(DeviceEvent::Log {
            cid,
            message,
            alert,
        });
    }
}
