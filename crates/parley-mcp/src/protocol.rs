//! JSON-RPC frames and tool-server wire types.
//!
//! Tool servers speak JSON-RPC 2.0 with the MCP method set: `initialize`,
//! `tools/list`, `prompts/list`, `tools/call`, plus server-originated
//! notifications (log, progress) and requests (elicitation, sampling).
//! These types model exactly the subset the connection manager exercises.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{McpError, Result};

/// Protocol revision sent during the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// ---------------------------------------------------------------------------
// JSON-RPC frames
// ---------------------------------------------------------------------------

/// Error object of a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A frame received from the server.
///
/// Besides responses to our requests, servers push notifications (progress,
/// log) and may initiate their own requests (elicitation, sampling), which
/// we must answer on the same channel.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    /// Response to one of our requests.
    Response {
        id: u64,
        result: std::result::Result<Value, RpcError>,
    },
    /// Server-initiated request; `id` is echoed back in our reply.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// Fire-and-forget notification.
    Notification { method: String, params: Value },
}

/// Build a request frame.
pub fn request_frame(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build a notification frame (no id, no response expected).
pub fn notification_frame(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

/// Build a response frame answering a server-initiated request.
pub fn response_frame(id: &Value, result: std::result::Result<Value, RpcError>) -> Value {
    match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(err) => json!({ "jsonrpc": "2.0", "id": id, "error": err }),
    }
}

/// Parse one line/frame of server output.
pub fn parse_frame(server: &str, raw: &str) -> Result<ServerFrame> {
    let v: Value = serde_json::from_str(raw).map_err(|e| McpError::Transport {
        server: server.to_owned(),
        reason: format!("invalid JSON-RPC frame: {e}"),
    })?;

    let id = v.get("id");
    let method = v.get("method").and_then(Value::as_str);

    match (id, method) {
        // A frame with both id and method is a server-initiated request.
        (Some(id), Some(method)) => Ok(ServerFrame::Request {
            id: id.clone(),
            method: method.to_owned(),
            params: v.get("params").cloned().unwrap_or(Value::Null),
        }),
        (None, Some(method)) => Ok(ServerFrame::Notification {
            method: method.to_owned(),
            params: v.get("params").cloned().unwrap_or(Value::Null),
        }),
        (Some(id), None) => {
            let id = id.as_u64().ok_or_else(|| McpError::Transport {
                server: server.to_owned(),
                reason: format!("response with non-numeric id: {id}"),
            })?;
            if let Some(err) = v.get("error") {
                let err: RpcError = serde_json::from_value(err.clone())?;
                Ok(ServerFrame::Response {
                    id,
                    result: Err(err),
                })
            } else {
                Ok(ServerFrame::Response {
                    id,
                    result: Ok(v.get("result").cloned().unwrap_or(Value::Null)),
                })
            }
        }
        (None, None) => Err(McpError::Transport {
            server: server.to_owned(),
            reason: "frame has neither id nor method".into(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Discovery types
// ---------------------------------------------------------------------------

/// A tool advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// JSON Schema for the tool's arguments.  Servers with partial or
    /// missing schemas are tolerated; consumers fall back conservatively.
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Names of the properties declared by the input schema, or `None` when
    /// the schema declares no property map at all.
    pub fn property_names(&self) -> Option<Vec<String>> {
        self.input_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().collect())
    }

    /// Whether the schema declares a specific property.
    pub fn declares_property(&self, name: &str) -> bool {
        self.input_schema
            .get("properties")
            .and_then(Value::as_object)
            .is_some_and(|props| props.contains_key(name))
    }
}

/// `tools/list` result payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// Argument declaration of an advertised prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// A prompt advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// `prompts/list` result payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListPromptsResult {
    #[serde(default)]
    pub prompts: Vec<PromptDescriptor>,
}

// ---------------------------------------------------------------------------
// Tool call results
// ---------------------------------------------------------------------------

/// One item of a tool result's content list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Content types this layer does not interpret (resources, audio, ...).
    #[serde(other)]
    Unknown,
}

/// Raw `tools/call` result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,

    /// Structured payload, when the server provides one.
    #[serde(
        default,
        rename = "structuredContent",
        alias = "structured_content",
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<Value>,

    /// Convenience payload some servers emit instead of structured content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

/// `prompts/get` result, kept loose: prompt messages flow through to the
/// prompt layer untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetPromptResult {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Value,
}

// ---------------------------------------------------------------------------
// Server-originated payloads
// ---------------------------------------------------------------------------

/// Params of a `notifications/progress` notification.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressParams {
    #[serde(rename = "progressToken")]
    pub progress_token: Value,
    pub progress: f64,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Params of a `notifications/message` log notification.
#[derive(Debug, Clone, Deserialize)]
pub struct LogParams {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub logger: Option<String>,
    #[serde(default)]
    pub data: Value,
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl LogParams {
    /// Extract a printable message from the free-form `data` payload.
    pub fn message_text(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("msg")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| self.data.to_string()),
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_frame() {
        let frame = parse_frame("srv", r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        match frame {
            ServerFrame::Response { id, result } => {
                assert_eq!(id, 3);
                assert_eq!(result.unwrap()["ok"], true);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parse_error_response() {
        let frame = parse_frame(
            "srv",
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        match frame {
            ServerFrame::Response { result, .. } => {
                let err = result.unwrap_err();
                assert_eq!(err.code, -32601);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parse_notification_and_request() {
        let n = parse_frame(
            "srv",
            r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"progressToken":"t","progress":0.5}}"#,
        )
        .unwrap();
        assert!(matches!(n, ServerFrame::Notification { ref method, .. } if method == "notifications/progress"));

        let r = parse_frame(
            "srv",
            r#"{"jsonrpc":"2.0","id":"req-1","method":"elicitation/create","params":{"message":"Pick one"}}"#,
        )
        .unwrap();
        match r {
            ServerFrame::Request { id, method, params } => {
                assert_eq!(id, Value::String("req-1".into()));
                assert_eq!(method, "elicitation/create");
                assert_eq!(params["message"], "Pick one");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn garbage_frame_is_transport_error() {
        assert!(parse_frame("srv", "not json").is_err());
        assert!(parse_frame("srv", "{}").is_err());
    }

    #[test]
    fn content_items_tolerate_unknown_types() {
        let result: CallToolResult = serde_json::from_str(
            r#"{"content":[
                {"type":"text","text":"hi"},
                {"type":"image","data":"aGk=","mimeType":"image/png"},
                {"type":"audio","data":"..."}
            ]}"#,
        )
        .unwrap();
        assert_eq!(result.content.len(), 3);
        assert!(matches!(result.content[0], ContentItem::Text { .. }));
        assert!(matches!(result.content[1], ContentItem::Image { .. }));
        assert!(matches!(result.content[2], ContentItem::Unknown));
    }

    #[test]
    fn tool_descriptor_property_introspection() {
        let tool: ToolDescriptor = serde_json::from_str(
            r#"{"name":"search","inputSchema":{"type":"object","properties":{"query":{"type":"string"},"username":{"type":"string"}}}}"#,
        )
        .unwrap();
        assert!(tool.declares_property("username"));
        assert!(!tool.declares_property("_mcp_data"));
        let mut names = tool.property_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["query", "username"]);

        let schemaless: ToolDescriptor = serde_json::from_str(r#"{"name":"ping"}"#).unwrap();
        assert!(schemaless.property_names().is_none());
    }
}
