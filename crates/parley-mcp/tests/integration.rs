//! End-to-end test of the stdio transport against a scripted tool server.
//!
//! The fake server is a shell script that answers the JSON-RPC requests the
//! manager sends (initialize, tools/list, prompts/list, tools/call) by
//! request id.  It exercises spawn, the initialize handshake, discovery,
//! the tool index, invocation, and result normalization without any
//! network.

#![cfg(unix)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use serde_json::json;

use parley_kernel::{ToolCall, ToolServerConfig};
use parley_mcp::{ServerManager, ServerManagerSettings};
use parley_vault::TokenVault;

const FAKE_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *'"id":1,'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26","capabilities":{},"serverInfo":{"name":"fake","version":"0.0.1"}}}'
      ;;
    *'"id":2,'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo the text back","inputSchema":{"type":"object","properties":{"text":{"type":"string"},"username":{"type":"string"}}}}]}}'
      ;;
    *'"id":3,'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"prompts":[{"name":"summarize","description":"Summarize a document"}]}}'
      ;;
    *'"id":4,'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":4,"result":{"content":[{"type":"text","text":"{\"results\": \"echoed\"}"}]}}'
      ;;
  esac
done
"#;

fn write_fake_server(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("fake-server.sh");
    std::fs::write(&path, FAKE_SERVER).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn manager_for(script: &std::path::Path) -> ServerManager {
    let config: ToolServerConfig = serde_json::from_value(json!({
        "command": ["/bin/sh", script.to_str().unwrap()],
        "description": "scripted fake server"
    }))
    .unwrap();

    let mut configs = HashMap::new();
    configs.insert("fake".to_owned(), config);

    let vault = Arc::new(
        TokenVault::open_in_memory(parley_vault::crypto::generate_master_key().unwrap()).unwrap(),
    );
    ServerManager::new(configs, vault, ServerManagerSettings::default())
}

#[tokio::test]
async fn stdio_server_discovery_and_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_fake_server(dir.path());
    let manager = manager_for(&script);

    manager.initialize_all().await;

    // Discovery populated the fully-qualified tool index.
    assert_eq!(manager.get_available_tools(), vec!["fake_echo"]);
    let descriptor = manager.tool_descriptor("fake_echo").unwrap();
    assert!(descriptor.declares_property("username"));

    // Prompts were discovered too.
    let prompts = manager.get_available_prompts(&["fake".to_owned()]);
    assert!(prompts.contains_key("fake_summarize"));

    // Schemas come back in function-calling form.
    let schemas = manager.get_tools_schema(&["fake_echo".to_owned()]);
    assert_eq!(schemas.len(), 1);
    assert_eq!(schemas[0]["function"]["name"], "fake_echo");

    // The digest lists the server and its qualified tools.
    let digest = manager.servers_digest().await;
    assert_eq!(digest["available_servers"][0]["server_name"], "fake");
    assert_eq!(
        digest["available_servers"][0]["tools"][0]["name"],
        "fake_echo"
    );

    // Invoke the tool end to end; the text content normalizes into the
    // `{results: ...}` record.
    let call = ToolCall::new("call_1", "fake_echo", json!({"text": "hi"}));
    let result = manager
        .execute_tool(&call, Some("user@example.com"), None, None)
        .await
        .unwrap();
    assert!(result.success, "tool call failed: {:?}", result.error);
    assert_eq!(result.tool_call_id, "call_1");
    let payload: serde_json::Value = serde_json::from_str(&result.content).unwrap();
    assert_eq!(payload["results"], "echoed");

    manager.shutdown().await;
}

#[tokio::test]
async fn missing_env_reference_disables_server() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_fake_server(dir.path());

    let config: ToolServerConfig = serde_json::from_value(json!({
        "command": ["/bin/sh", script.to_str().unwrap()],
        "env": {"API_KEY": "${PARLEY_INTEGRATION_UNSET_VAR}"}
    }))
    .unwrap();
    let mut configs = HashMap::new();
    configs.insert("needs-env".to_owned(), config);

    let vault = Arc::new(
        TokenVault::open_in_memory(parley_vault::crypto::generate_master_key().unwrap()).unwrap(),
    );
    let manager = ServerManager::new(configs, vault, ServerManagerSettings::default());

    manager.initialize_all().await;

    // The server was skipped and recorded as failed; nothing was indexed.
    assert!(manager.get_available_tools().is_empty());
    let failed = manager.get_failed_servers().await;
    assert!(failed.contains_key("needs-env"));
    assert!(failed["needs-env"].last_error.contains("PARLEY_INTEGRATION_UNSET_VAR"));
}
