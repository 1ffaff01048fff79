//! JSON-RPC 2.0 envelope types and error codes
//!
//! Requests are parsed from untrusted JSON and checked for well-formedness
//! before any routing happens. Responses always carry exactly one of
//! `result` or `error`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes surfaced on the wire.
///
/// The first five are the JSON-RPC standard range; the rest are the
/// server-defined domain range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    Unauthorized,
    NotFound,
    RateLimited,
    ExternalService,
    Timeout,
}

impl ErrorCode {
    pub const fn code(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::Unauthorized => -32001,
            Self::NotFound => -32002,
            Self::RateLimited => -32003,
            Self::ExternalService => -32004,
            Self::Timeout => -32005,
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::Unauthorized => "Unauthorized",
            Self::NotFound => "Not found",
            Self::RateLimited => "Rate limit exceeded",
            Self::ExternalService => "External service unavailable",
            Self::Timeout => "Timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.message().to_string(),
            data: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Attaches a machine-readable detail object in the `{code, message, details}` shape.
    pub fn with_detail(mut self, detail_code: &str, detail_message: &str, details: Value) -> Self {
        self.data = Some(json!({
            "code": detail_code,
            "message": detail_message,
            "details": details,
        }));
        self
    }
}

/// An incoming request or notification.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Version tag matches and the method name is non-empty.
    pub fn is_valid(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION
            && !self.method.trim().is_empty()
            && self.id.as_ref().map_or(true, is_valid_request_id)
    }
}

pub fn is_valid_request_id(id: &Value) -> bool {
    id.is_string() || id.is_i64() || id.is_u64() || id.is_null()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePayload {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl JsonRpcResponse {
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: id.unwrap_or(Value::Null),
            payload: ResponsePayload::Result(result),
        }
    }

    pub fn error(id: Option<Value>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: id.unwrap_or(Value::Null),
            payload: ResponsePayload::Error(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    pub fn error_code(&self) -> Option<i64> {
        match &self.payload {
            ResponsePayload::Error(error) => Some(error.code),
            ResponsePayload::Result(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match &self.payload {
            ResponsePayload::Result(result) => json!({
                "jsonrpc": self.jsonrpc,
                "id": self.id,
                "result": result,
            }),
            ResponsePayload::Error(error) => json!({
                "jsonrpc": self.jsonrpc,
                "id": self.id,
                "error": error,
            }),
        }
    }
}

pub fn json_rpc_error(id: Option<Value>, code: ErrorCode) -> JsonRpcResponse {
    JsonRpcResponse::error(id, RpcError::new(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_requires_version_and_method() {
        let valid: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": "1", "method": "tools/list"}))
                .expect("request parses");
        assert!(valid.is_valid());
        assert!(!valid.is_notification());

        let wrong_version: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "1.0", "id": "1", "method": "tools/list"}))
                .expect("request parses");
        assert!(!wrong_version.is_valid());

        let blank_method: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": "1", "method": "  "}))
                .expect("request parses");
        assert!(!blank_method.is_valid());
    }

    #[test]
    fn object_ids_are_rejected() {
        let request: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": {"a": 1}, "method": "ping"}))
                .expect("request parses");
        assert!(!request.is_valid());
    }

    #[test]
    fn error_response_carries_no_result() {
        let response = json_rpc_error(Some(json!("7")), ErrorCode::MethodNotFound);
        let value = serde_json::to_value(&response).expect("serializes");

        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], "7");
        assert_eq!(value["error"]["code"], -32601);
        assert_eq!(value["error"]["message"], "Method not found");
        assert!(value.get("result").is_none());
        assert_eq!(value, response.to_value());
    }

    #[test]
    fn result_response_echoes_null_id_when_absent() {
        let value = JsonRpcResponse::result(None, json!({})).to_value();
        assert!(value["id"].is_null());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn domain_codes_sit_outside_standard_range() {
        for code in [
            ErrorCode::Unauthorized,
            ErrorCode::NotFound,
            ErrorCode::RateLimited,
            ErrorCode::ExternalService,
            ErrorCode::Timeout,
        ] {
            assert!(code.code() > -32100 && code.code() < -32000);
        }
    }
}
