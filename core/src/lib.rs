// This crate contains the transport-independent pieces of DDX-RPC:
// - Message model and standard error codes
// - Newline-delimited wire codec
// - Device roles, disconnect reasons and the registration payload
// - Configuration loading
// - Shared error types

// Export rpc_types module - Message envelope and error codes
pub mod rpc_types;
pub use rpc_types::{ErrorCode, Message, RpcError};

// Export codec module - Frame encoding and decoding
pub mod codec;
pub use codec::{CodecError, Frame};

// Export device module - Roles, disconnect reasons, registration
pub mod device;
pub use device::{DeviceRoles, DisconnectReason, RegistrationParams};

// Export config module - Configuration loading
pub mod config;
pub use config::*;

// Export errors module - Shared error types
pub mod errors;
pub use errors::*;
