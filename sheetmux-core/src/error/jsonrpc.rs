//! Wire shape of proxy-generated JSON-RPC errors.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::jsonrpc::JsonRpcId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

/// `error.data` on every failure the proxy itself produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ErrorData {
    /// Also logged, so a client report can be matched to proxy logs.
    pub correlation_id: String,
    /// Stable snake_case kind, e.g. `child_crashed`.
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Seconds. Present only on retriable kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl JsonRpcError {
    /// Full response envelope; `id` is null when the request had none.
    pub fn into_response(self, id: Option<&JsonRpcId>) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id.map_or(Value::Null, JsonRpcId::to_value),
            "error": self,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonrpc_error_serialization() {
        let error = JsonRpcError {
            code: -32013,
            message: "call timed out".to_string(),
            data: Some(ErrorData {
                correlation_id: "550e8400-e29b-41d4-a716-446655440000".to_string(),
                error_type: "call_timeout".to_string(),
                session_id: Some("s-1".to_string()),
                details: None,
                retry_after: Some(0),
            }),
        };

        let json = serde_json::to_value(&error).unwrap();

        assert_eq!(json["code"], -32013);
        assert_eq!(json["data"]["error_type"], "call_timeout");
        assert_eq!(json["data"]["session_id"], "s-1");
        assert!(json["data"].get("details").is_none());
    }

    #[test]
    fn test_error_without_data_omits_field() {
        let error = JsonRpcError {
            code: -32600,
            message: "bad".to_string(),
            data: None,
        };
        let json = serde_json::to_value(&error).unwrap();
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_into_response_envelope() {
        let error = JsonRpcError {
            code: -32600,
            message: "bad".to_string(),
            data: None,
        };
        let resp = error.clone().into_response(Some(&JsonRpcId::String("a".into())));
        assert_eq!(resp["jsonrpc"], "2.0");
        assert_eq!(resp["id"], "a");
        assert_eq!(resp["error"]["code"], -32600);

        let resp = error.into_response(None);
        assert!(resp["id"].is_null());
    }
}
