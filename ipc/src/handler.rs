//! Handles handed to application code, and the two collaborator traits the
//! connection routes traffic into.

use crate::connection::DeviceHandle;
use crate::correlation::LocalId;
use ddx_core::rpc_types::{ErrorCode, RpcError};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// An inbound request or notification.
///
/// Move-only: answering consumes it, so a request can be answered at most once.
/// Dropping it unanswered leaves the peer to time out.
#[derive(Debug)]
pub struct Request {
    /// Method name
    pub method: String,
    /// The `params` object, if any
    pub params: Option<Value>,
    /// The connection the request arrived on
    pub device: DeviceHandle,
    id: Option<Value>,
}

impl Request {
    pub(crate) fn new(
        method: String,
        params: Option<Value>,
        id: Option<Value>,
        device: DeviceHandle,
    ) -> Self {
        Self {
            method,
            params,
            device,
            id,
        }
    }

    /// False for notifications, which cannot be answered.
    pub fn is_request(&self) -> bool {
        self.id.is_some()
    }

    pub(crate) fn into_id(self) -> Option<Value> {
        self.id
    }

    /// Shorthand for [`DeviceHandle::send_response`] on the originating device.
    pub fn respond(self, result: Option<Value>) {
        let device = self.device.clone();
        device.send_response(self, result);
    }

    /// Shorthand for [`DeviceHandle::send_error_code`] on the originating device.
    pub fn respond_error(self, code: ErrorCode) {
        let device = self.device.clone();
        device.send_error_code(self, code);
    }
}

/// The answer to a request issued with [`DeviceHandle::send_request`].
#[derive(Debug)]
pub struct Response {
    /// False if the peer (or a local timeout) produced an error
    pub successful: bool,
    /// The id returned by `send_request`
    pub id: LocalId,
    /// The result on success, otherwise a verified error object
    pub main_val: Value,
    /// Method name passed to `send_request`
    pub method: String,
    /// The connection the response arrived on
    pub device: DeviceHandle,
}

impl Response {
    /// The error object, when unsuccessful.
    pub fn error(&self) -> Option<RpcError> {
        if self.successful {
            return None;
        }
        serde_json::from_value(self.main_val.clone()).ok()
    }

    pub fn error_code(&self) -> Option<i64> {
        if self.successful {
            return None;
        }
        self.main_val.get("code").and_then(Value::as_i64)
    }

    pub fn is_timeout(&self) -> bool {
        self.error_code() == Some(ErrorCode::RequestTimedOut.code())
    }
}

/// Receives responses to outgoing requests.
///
/// Called from the connection task; implementations must hand the response to
/// their own task (see [`ResponseQueue`]) rather than doing work inline.
pub trait ResponseHandler: Send + Sync + 'static {
    fn on_response(&self, response: Response);
}

/// Receives inbound requests and notifications once a peer is registered.
///
/// The same non-blocking rule as [`ResponseHandler`] applies.
pub trait RequestHandler: Send + Sync + 'static {
    fn on_request(&self, request: Request);
}

/// Response handler that posts onto a channel owned by the requester.
///
/// Keep the `Arc` alive for as long as responses are wanted; once it is dropped
/// pending responses are discarded.
#[derive(Debug)]
pub struct ResponseQueue {
    tx: mpsc::UnboundedSender<Response>,
}

impl ResponseQueue {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ResponseHandler for ResponseQueue {
    fn on_response(&self, response: Response) {
        if self.tx.send(response).is_err() {
            debug!("Response receiver dropped; discarding response");
        }
    }
}

/// Request handler that posts onto a channel drained by a dispatcher task.
#[derive(Debug)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Request>,
}

impl RequestQueue {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Request>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl RequestHandler for RequestQueue {
    fn on_request(&self, request: Request) {
        if let Err(mpsc::error::SendError(request)) = self.tx.send(request) {
            request.respond_error(ErrorCode::InternalError);
        }
    }
}

/// Answers every request with `MethodNotFound`; for endpoints that serve nothing.
#[derive(Debug, Default)]
pub struct RejectAll;

impl RequestHandler for RejectAll {
    fn on_request(&self, request: Request) {
        if request.is_request() {
            request.respond_error(ErrorCode::MethodNotFound);
        } else {
            debug!(method = %request.method, "Ignoring notification");
        }
    }
}
