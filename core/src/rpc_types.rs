use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One DDX-RPC document as it travels on the wire.
///
/// Whether a `method`-bearing message is a request or a notification is decided
/// solely by the presence of `id`. Responses never carry a method.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `{method, id, params?}`; `id` is never null
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// `{method, params?}`
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// `{id, result}`
    Response { id: Value, result: Value },
    /// `{id, error}`; `id` may be null when the peer could not read the request id
    Error { id: Value, error: RpcError },
}

impl Message {
    pub fn request(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    /// Builds a success response. An omitted result acknowledges with `true`.
    pub fn response(id: Value, result: Option<Value>) -> Self {
        Message::Response {
            id,
            result: result.unwrap_or(Value::Bool(true)),
        }
    }

    pub fn error(id: Value, error: RpcError) -> Self {
        Message::Error { id, error }
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            _ => None,
        }
    }

    /// Transaction id; `None` only for notifications.
    pub fn id(&self) -> Option<&Value> {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } | Message::Error { id, .. } => {
                Some(id)
            }
            Message::Notification { .. } => None,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response { .. } | Message::Error { .. })
    }
}

/// A verified DDX-RPC error object.
///
/// Only ever constructed from an integer `code` and a string `message`; the
/// codec refuses anything else.
#[derive(Error, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    /// Error carrying the standard message for a reserved code.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code.code(), code.message(), None)
    }

    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("code".to_string(), Value::from(self.code));
        obj.insert("message".to_string(), Value::from(self.message.clone()));
        if let Some(data) = &self.data {
            obj.insert("data".to_string(), data.clone());
        }
        Value::Object(obj)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DDX-RPC Error (code {}): {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " (Data: {})", data)?;
        }
        Ok(())
    }
}

/// Reserved, method-independent error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InternalError,
    InvalidParams,
    MethodNotFound,
    AccessDenied,
    NotSupported,
    RequestTimedOut,
}

impl ErrorCode {
    pub const fn code(self) -> i64 {
        match self {
            ErrorCode::InternalError => -32603,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::AccessDenied => -32001,
            ErrorCode::NotSupported => -32002,
            ErrorCode::RequestTimedOut => -32003,
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            ErrorCode::InternalError => "Internal error",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::AccessDenied => "Access denied",
            ErrorCode::NotSupported => "Not supported",
            ErrorCode::RequestTimedOut => "Request timed out",
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        [
            ErrorCode::InternalError,
            ErrorCode::InvalidParams,
            ErrorCode::MethodNotFound,
            ErrorCode::AccessDenied,
            ErrorCode::NotSupported,
            ErrorCode::RequestTimedOut,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }
}
