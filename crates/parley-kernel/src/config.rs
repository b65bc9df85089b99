//! Typed configuration records.
//!
//! Parsing the config files that produce these records is the host
//! application's job; the core consumes them fully formed.  What lives here
//! is the shape of each record, `${VAR}` environment reference expansion,
//! and the diffing used for runtime config reload.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// How a tool server authenticates callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// No authentication; the shared connection serves all users.
    #[default]
    None,
    /// Static API key sent in a configurable header.
    ApiKey,
    /// Bearer token.
    Bearer,
    /// JWT bearer token.
    Jwt,
    /// OAuth 2.1 access token.
    Oauth,
}

impl AuthType {
    /// Whether this server needs a per-user credential rather than a shared
    /// connection.
    pub fn is_per_user(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Wire name, matching the serde form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ApiKey => "api_key",
            Self::Bearer => "bearer",
            Self::Jwt => "jwt",
            Self::Oauth => "oauth",
        }
    }
}

/// Transport used to reach a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawn a child process and speak JSON-RPC over stdin/stdout.
    Stdio,
    /// Streamable HTTP endpoint.
    Http,
    /// Server-sent events endpoint.
    Sse,
}

/// Where the API key for an LLM model comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeySource {
    /// Resolved from the process environment at startup.
    #[default]
    System,
    /// Looked up per user in token storage.
    User,
}

// ---------------------------------------------------------------------------
// LLM model configuration
// ---------------------------------------------------------------------------

/// Configuration for a single LLM model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmModelConfig {
    /// Provider model identifier.
    pub model_name: String,

    /// Endpoint base URL.
    pub model_url: String,

    /// API key, possibly an `${ENV_VAR}` reference.
    #[serde(default)]
    pub api_key: String,

    /// Whether the key is system-wide or per-user.
    #[serde(default)]
    pub api_key_source: ApiKeySource,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub temperature: Option<f32>,

    /// Extra HTTP headers some providers require.
    #[serde(default)]
    pub extra_headers: Option<HashMap<String, String>>,

    #[serde(default)]
    pub compliance_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Tool server configuration
// ---------------------------------------------------------------------------

/// OAuth 2.1 settings for servers with `auth_type = "oauth"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OauthSettings {
    #[serde(default)]
    pub scopes: Option<Vec<String>>,

    /// Client name used for dynamic registration.
    #[serde(default)]
    pub client_name: Option<String>,

    /// Fixed callback port, random when absent.
    #[serde(default)]
    pub callback_port: Option<u16>,
}

/// Configuration for one external tool server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub short_description: Option<String>,

    /// Access-control group labels; empty means everyone.
    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Command line for stdio servers (program + args).
    #[serde(default)]
    pub command: Option<Vec<String>>,

    /// Working directory for the command, resolved against the project root
    /// when relative.
    #[serde(default)]
    pub cwd: Option<String>,

    /// Environment for the child process.  Values may contain `${VAR}`
    /// references; an unresolvable reference disables the server.
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,

    /// Endpoint for http/sse servers.
    #[serde(default)]
    pub url: Option<String>,

    /// Explicit transport; takes priority over auto-detection.
    #[serde(default)]
    pub transport: Option<TransportKind>,

    /// Legacy transport field, consulted only when nothing else decides.
    #[serde(default, rename = "type")]
    pub kind: Option<TransportKind>,

    #[serde(default)]
    pub auth_type: AuthType,

    /// Header used for `api_key` auth (default `X-API-Key`).
    #[serde(default)]
    pub auth_header: Option<String>,

    /// Shared bearer token for the server connection, possibly an
    /// `${ENV_VAR}` reference.
    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default)]
    pub oauth: Option<OauthSettings>,

    #[serde(default)]
    pub compliance_level: Option<String>,

    /// Tool base names that always require approval (admin-enforced).
    #[serde(default)]
    pub require_approval: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ToolServerConfig {
    /// Resolve the transport for this server.
    ///
    /// Priority: explicit `transport` > command implies stdio > url with an
    /// http(s) scheme implies http (sse when the path ends in `/sse`) >
    /// legacy `type` field > stdio.
    pub fn resolve_transport(&self) -> TransportKind {
        if let Some(t) = self.transport {
            return t;
        }
        if self.command.is_some() {
            return TransportKind::Stdio;
        }
        if let Some(url) = &self.url {
            if url.starts_with("http://") || url.starts_with("https://") {
                return if url.ends_with("/sse") {
                    TransportKind::Sse
                } else {
                    TransportKind::Http
                };
            }
            // URL without a scheme: honor the legacy type field when it
            // names an HTTP-ish transport, otherwise assume http.
            return match self.kind {
                Some(TransportKind::Sse) => TransportKind::Sse,
                Some(TransportKind::Http) | None => TransportKind::Http,
                Some(TransportKind::Stdio) => TransportKind::Http,
            };
        }
        self.kind.unwrap_or(TransportKind::Stdio)
    }

    /// The endpoint URL with a scheme guaranteed.
    pub fn endpoint_url(&self) -> Option<String> {
        self.url.as_ref().map(|u| {
            if u.starts_with("http://") || u.starts_with("https://") {
                u.clone()
            } else {
                format!("http://{u}")
            }
        })
    }

    /// Whether a change from `old` to `self` must invalidate cached
    /// per-user clients for this server.
    pub fn auth_surface_changed(&self, old: &Self) -> bool {
        self.url != old.url
            || self.auth_type != old.auth_type
            || self.auth_header != old.auth_header
    }
}

// ---------------------------------------------------------------------------
// Approval policy
// ---------------------------------------------------------------------------

/// Per-tool approval rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolApprovalRule {
    /// Admin-enforced approval requirement for this tool.
    #[serde(default)]
    pub require_approval: bool,
}

/// Tool approval policy for the whole deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolApprovalsConfig {
    /// When set, every tool requires approval and users cannot opt out.
    #[serde(default)]
    pub force_approval_globally: bool,

    /// Per-tool rules keyed by fully qualified tool name.
    #[serde(default)]
    pub tools: HashMap<String, ToolApprovalRule>,
}

// ---------------------------------------------------------------------------
// Timing settings
// ---------------------------------------------------------------------------

/// Reconnect/backoff parameters for failed tool servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Base retry interval in seconds (also the auto-reconnect sweep
    /// period).
    pub base_interval_secs: u64,

    /// Cap on the computed backoff delay, in seconds.
    pub max_interval_secs: u64,

    /// Exponential multiplier applied per failed attempt.
    pub multiplier: f64,

    /// Whether the background auto-reconnect task should run.
    pub auto_reconnect: bool,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_interval_secs: 60,
            max_interval_secs: 300,
            multiplier: 2.0,
            auto_reconnect: false,
        }
    }
}

impl ReconnectSettings {
    /// Backoff delay before retry number `attempt_count + 1`.
    ///
    /// `base * multiplier^(attempt_count - 1)`, capped at the maximum.
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        let attempts = attempt_count.max(1);
        let delay =
            self.base_interval_secs as f64 * self.multiplier.powi(attempts as i32 - 1);
        Duration::from_secs_f64(delay.min(self.max_interval_secs as f64))
    }
}

/// Deadlines for tool-server I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTimeouts {
    /// `tools/list` / `prompts/list` deadline, seconds.
    pub discovery_secs: u64,

    /// `tools/call` deadline, seconds.
    pub call_secs: u64,
}

impl Default for McpTimeouts {
    fn default() -> Self {
        Self {
            discovery_secs: 30,
            call_secs: 120,
        }
    }
}

/// Deadlines for user interaction waits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalTimeouts {
    pub approval_secs: u64,
    pub elicitation_secs: u64,
    /// Cumulative budget for the react loop's user-input wait.
    pub user_input_secs: u64,
}

impl Default for ApprovalTimeouts {
    fn default() -> Self {
        Self {
            approval_secs: 300,
            elicitation_secs: 300,
            user_input_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment reference expansion
// ---------------------------------------------------------------------------

/// Expand `${VAR}` references in a configuration value.
///
/// Values without references pass through unchanged.  A reference to an
/// unset variable is an error; the caller disables the affected server and
/// moves on.
pub fn resolve_env_refs(value: &str) -> Result<String> {
    if !value.contains("${") {
        return Ok(value.to_owned());
    }

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference; keep the literal text.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        match std::env::var(name) {
            Ok(v) => out.push_str(&v),
            Err(_) => {
                return Err(KernelError::MissingEnvVar {
                    name: name.to_owned(),
                    reference: value.to_owned(),
                });
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Config reload diffing
// ---------------------------------------------------------------------------

/// The result of diffing a new server-config map against the current one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Present in both but with different settings.
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ConfigDiff {
    /// True when the reload was a no-op.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Diff two server configuration maps by name and content.
pub fn diff_server_configs(
    current: &HashMap<String, ToolServerConfig>,
    next: &HashMap<String, ToolServerConfig>,
) -> ConfigDiff {
    let mut diff = ConfigDiff::default();

    for name in next.keys() {
        match current.get(name) {
            None => diff.added.push(name.clone()),
            Some(old) if old != &next[name] => diff.changed.push(name.clone()),
            Some(_) => diff.unchanged.push(name.clone()),
        }
    }
    for name in current.keys() {
        if !next.contains_key(name) {
            diff.removed.push(name.clone());
        }
    }

    diff.added.sort();
    diff.removed.sort();
    diff.changed.sort();
    diff.unchanged.sort();
    diff
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server(value: serde_json::Value) -> ToolServerConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn explicit_transport_wins() {
        let cfg = server(json!({
            "command": ["python", "server.py"],
            "transport": "http",
            "url": "http://localhost:9000"
        }));
        assert_eq!(cfg.resolve_transport(), TransportKind::Http);
    }

    #[test]
    fn command_implies_stdio() {
        let cfg = server(json!({"command": ["./tool-server"]}));
        assert_eq!(cfg.resolve_transport(), TransportKind::Stdio);
    }

    #[test]
    fn url_scheme_detection() {
        let cfg = server(json!({"url": "https://tools.example.com/mcp"}));
        assert_eq!(cfg.resolve_transport(), TransportKind::Http);

        let cfg = server(json!({"url": "https://tools.example.com/sse"}));
        assert_eq!(cfg.resolve_transport(), TransportKind::Sse);
    }

    #[test]
    fn schemeless_url_honors_type_field() {
        let cfg = server(json!({"url": "tools.internal:9000", "type": "sse"}));
        assert_eq!(cfg.resolve_transport(), TransportKind::Sse);

        let cfg = server(json!({"url": "tools.internal:9000"}));
        assert_eq!(cfg.resolve_transport(), TransportKind::Http);
        assert_eq!(
            cfg.endpoint_url().as_deref(),
            Some("http://tools.internal:9000")
        );
    }

    #[test]
    fn default_transport_is_stdio() {
        let cfg = server(json!({}));
        assert_eq!(cfg.resolve_transport(), TransportKind::Stdio);
    }

    #[test]
    fn per_user_auth_detection() {
        assert!(!AuthType::None.is_per_user());
        assert!(AuthType::ApiKey.is_per_user());
        assert!(AuthType::Oauth.is_per_user());
    }

    #[test]
    fn backoff_progression_and_cap() {
        let settings = ReconnectSettings {
            base_interval_secs: 10,
            max_interval_secs: 100,
            multiplier: 2.0,
            auto_reconnect: false,
        };
        assert_eq!(settings.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(settings.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(settings.delay_for_attempt(3), Duration::from_secs(40));
        // Attempt 6 would be 320s uncapped.
        assert_eq!(settings.delay_for_attempt(6), Duration::from_secs(100));
    }

    #[test]
    fn env_refs_expand() {
        // Safety: test-local variable, no concurrent reader depends on it.
        unsafe { std::env::set_var("PARLEY_TEST_TOKEN", "s3cret") };
        let resolved = resolve_env_refs("Bearer ${PARLEY_TEST_TOKEN}").unwrap();
        assert_eq!(resolved, "Bearer s3cret");

        let plain = resolve_env_refs("no refs here").unwrap();
        assert_eq!(plain, "no refs here");
    }

    #[test]
    fn missing_env_ref_is_an_error() {
        let err = resolve_env_refs("${PARLEY_TEST_DEFINITELY_UNSET}").unwrap_err();
        match err {
            KernelError::MissingEnvVar { name, .. } => {
                assert_eq!(name, "PARLEY_TEST_DEFINITELY_UNSET");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn identical_reload_produces_empty_diff() {
        let mut servers = HashMap::new();
        servers.insert("calc".to_owned(), server(json!({"command": ["calc"]})));
        let diff = diff_server_configs(&servers, &servers.clone());
        assert!(diff.is_empty());
        assert_eq!(diff.unchanged, vec!["calc"]);
    }

    #[test]
    fn diff_detects_added_removed_changed() {
        let mut current = HashMap::new();
        current.insert("a".to_owned(), server(json!({"command": ["a"]})));
        current.insert("b".to_owned(), server(json!({"url": "http://b/mcp"})));

        let mut next = HashMap::new();
        next.insert(
            "b".to_owned(),
            server(json!({"url": "http://b/mcp", "auth_type": "bearer"})),
        );
        next.insert("c".to_owned(), server(json!({"command": ["c"]})));

        let diff = diff_server_configs(&current, &next);
        assert_eq!(diff.added, vec!["c"]);
        assert_eq!(diff.removed, vec!["a"]);
        assert_eq!(diff.changed, vec!["b"]);

        let old_b = &current["b"];
        let new_b = &next["b"];
        assert!(new_b.auth_surface_changed(old_b));
    }
}
