//! JSON-RPC 2.0 envelope types for the `/api/rooms/:pairId/a2a` surface:
//! request/response/error structs shared with the `/api/ws` internal RPC
//! dispatch, since both are plain JSON-RPC 2.0 over a different method
//! table.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn from_error(id: Value, err: &cv_domain::Error) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code: err.rpc_code(),
                message: err.to_string(),
                data: None,
            }),
        }
    }

    /// `-32600`: malformed transport input (not even a valid envelope).
    pub fn invalid_request(id: Value, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code: -32600,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// `-32602`: envelope parsed but `params` didn't match what the method expects.
    pub fn invalid_params(id: Value, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code: -32602,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_with_default_id_when_absent() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"tasks/get","params":{}}"#).unwrap();
        assert_eq!(req.method, "tasks/get");
        assert!(req.id.is_null());
    }

    #[test]
    fn ok_response_omits_error_field() {
        let resp = JsonRpcResponse::ok(Value::from(1), serde_json::json!({"a": 1}));
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v.get("error").is_none());
        assert!(v.get("result").is_some());
    }

    #[test]
    fn error_response_omits_result_field() {
        let resp = JsonRpcResponse::invalid_request(Value::from(1), "bad");
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v.get("result").is_none());
        assert_eq!(v["error"]["code"], -32600);
    }
}
