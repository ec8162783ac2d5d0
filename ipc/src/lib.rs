// DDX-RPC connection engine: peers exchange newline-delimited JSON requests,
// responses and notifications after a two-way registration handshake.

pub mod correlation; // Request id allocation and the pending-request table
pub mod handler; // Request/Response handles and the collaborator traits
pub mod connection; // Per-peer actor and its cloneable DeviceHandle
pub mod transport; // Establishment, line framing and the writer task
pub mod tls; // rustls acceptor/connector from configuration
pub mod registry; // DevMgr: live devices plus the DeviceEvent channel
pub mod poller; // Shared timeout sweep
pub mod listener; // TCP accept loop and outbound connect

#[cfg(test)]
mod testing;

pub use connection::{
    ConnectionContext, ConnectionSettings, DeviceHandle, DeviceId, DeviceSummary,
};
pub use correlation::LocalId;
pub use handler::{RejectAll, Request, RequestHandler, RequestQueue, Response, ResponseHandler, ResponseQueue};
pub use listener::{connect, Listener};
pub use poller::spawn_timeout_poller;
pub use registry::{DevMgr, DeviceEvent};
pub use transport::{Direction, Encryption, PendingTransport};
