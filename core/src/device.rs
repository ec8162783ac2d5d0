use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Method name of the registration assertion each side sends first.
pub const REGISTER_METHOD: &str = "register";

/// Method name of the notification announcing a close and its reason.
pub const DISCONNECT_METHOD: &str = "disconnect";

/// Registration protocol revision; peers must match exactly.
pub const PROTOCOL_VERSION: u32 = 1;

bitflags! {
    /// Capabilities a registered peer advertises.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceRoles: u8 {
        /// Can execute pipelines
        const DAEMON = 0x1;
        /// An interface for a device which executes pipelines
        const MANAGER = 0x2;
        /// Produces or consumes data without executing pipelines
        const VERTEX = 0x4;
        /// A destination for log lines and alerts
        const LISTENER = 0x8;
        /// Pseudo-role for role-less broadcast information
        const GLOBAL = 0x80;
    }
}

impl Serialize for DeviceRoles {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        bitflags::serde::serialize(self, serializer)
    }
}

impl<'de> Deserialize<'de> for DeviceRoles {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        bitflags::serde::deserialize(deserializer)
    }
}

impl DeviceRoles {
    /// Whether a broadcast addressed to `audience` is meaningful to this peer.
    pub fn accepts(self, audience: DeviceRoles) -> bool {
        audience.contains(DeviceRoles::GLOBAL) || self.intersects(audience)
    }
}

/// Why a connection ended. Every close carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The disconnecting member is shutting down by request
    ShuttingDown,
    /// The disconnecting member is restarting and will be back shortly
    Restarting,
    /// The disconnecting member experienced a fatal error
    FatalError,
    /// The connection was explicitly terminated
    ConnectionTerminated,
    /// The connection was alive too long without registering
    RegistrationTimeout,
    /// The connection sent an object too long to be handled
    BufferOverflow,
    /// The stream was closed by its low-level handler
    StreamClosed,
    /// Encryption is required on this connection
    EncryptionRequired,
    /// Unknown disconnection; also what unrecognised reasons decode to
    #[serde(other)]
    UnknownReason,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DisconnectReason::UnknownReason => "unknown reason",
            DisconnectReason::ShuttingDown => "shutting down",
            DisconnectReason::Restarting => "restarting",
            DisconnectReason::FatalError => "fatal error",
            DisconnectReason::ConnectionTerminated => "connection terminated",
            DisconnectReason::RegistrationTimeout => "registration timeout",
            DisconnectReason::BufferOverflow => "buffer overflow",
            DisconnectReason::StreamClosed => "stream closed",
            DisconnectReason::EncryptionRequired => "encryption required",
        };
        f.write_str(text)
    }
}

/// Parameters of the `register` request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RegistrationParams {
    pub cid: String,
    /// Raw role bits; unknown bits are ignored
    pub roles: u8,
    pub protocol: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl RegistrationParams {
    pub fn new(cid: impl Into<String>, roles: DeviceRoles) -> Self {
        Self {
            cid: cid.into(),
            roles: roles.bits(),
            protocol: PROTOCOL_VERSION,
            locale: None,
        }
    }

    pub fn roles(&self) -> DeviceRoles {
        DeviceRoles::from_bits_truncate(self.roles)
    }

    /// Checks the parts of the assertion the connection relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.cid.trim().is_empty() {
            return Err("cid must not be empty".to_string());
        }
        if self.protocol != PROTOCOL_VERSION {
            return Err(format!(
                "unsupported protocol version {} (expected {})",
                self.protocol, PROTOCOL_VERSION
            ));
        }
        Ok(())
    }
}

/// Parameters of the `disconnect` notification.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct DisconnectParams {
    pub reason: DisconnectReason,
}
