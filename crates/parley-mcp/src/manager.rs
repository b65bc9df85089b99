//! Tool-server connection manager.
//!
//! Owns the live map of server connections, discovers their tools and
//! prompts, tracks failures with exponential backoff, reconnects on demand
//! or from an opt-in background task, and routes per-user authentication.
//!
//! Connections for servers without per-user auth are shared across
//! requests.  Servers with `auth_type` other than `none` get a
//! request-scoped connection built from the calling user's stored token,
//! cached by `(user, server)` and invalidated when the token stops being
//! valid.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use parley_kernel::{
    AuthType, ConfigDiff, EventSink, McpTimeouts, ReconnectSettings, ToolCall, ToolResult,
    ToolServerConfig, TransportKind, diff_server_configs, resolve_env_refs,
};
use parley_vault::TokenStore;

use crate::error::{McpError, Result};
use crate::normalize::normalize_tool_result;
use crate::protocol::{
    CallToolResult, GetPromptResult, ListPromptsResult, ListToolsResult, PromptDescriptor,
    ToolDescriptor,
};
use crate::routing::{CallSinks, CallbackRouter, ElicitationHandler, SamplingHandler};
use crate::transport::http::{HttpAuth, HttpTransport};
use crate::transport::stdio::StdioTransport;
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Settings and reports
// ---------------------------------------------------------------------------

/// Tunables for the manager.
#[derive(Debug, Clone, Default)]
pub struct ServerManagerSettings {
    pub reconnect: ReconnectSettings,
    pub timeouts: McpTimeouts,
    /// Base for resolving relative stdio working directories.
    pub project_root: Option<PathBuf>,
}

/// Failure state of a server that is not currently connected.
struct FailureRecord {
    first_failure: DateTime<Utc>,
    last_attempt: Instant,
    attempt_count: u32,
    last_error: String,
}

/// Snapshot of one failed server, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct FailureInfo {
    pub first_failure: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: String,
}

/// A server skipped by a non-forced reconnect because its backoff delay has
/// not elapsed yet.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedServer {
    pub server: String,
    pub wait_remaining_secs: f64,
    pub attempt_count: u32,
}

/// Result of one reconnect sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconnectReport {
    pub attempted: Vec<String>,
    pub reconnected: Vec<String>,
    pub still_failed: Vec<String>,
    pub skipped_backoff: Vec<SkippedServer>,
}

/// Cached discovery results for one connected server.
struct ServerInventory {
    tools: Vec<ToolDescriptor>,
    prompts: Vec<PromptDescriptor>,
}

/// One entry of the fully-qualified tool index.
struct ToolIndexEntry {
    server: String,
    tool: ToolDescriptor,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Manager for tool servers and their tools.
pub struct ServerManager {
    configs: RwLock<HashMap<String, ToolServerConfig>>,
    connections: DashMap<String, Arc<dyn Transport>>,
    inventory: DashMap<String, ServerInventory>,
    /// `"{server}_{tool}"` -> owning server + descriptor, for O(1) lookup.
    tool_index: DashMap<String, ToolIndexEntry>,
    failures: Mutex<HashMap<String, FailureRecord>>,
    /// `(user_email, server)` -> per-user connection.
    user_connections: Mutex<HashMap<(String, String), Arc<dyn Transport>>>,
    tokens: Arc<dyn TokenStore>,
    router: CallbackRouter,
    sampling: std::sync::RwLock<Option<Arc<dyn SamplingHandler>>>,
    settings: ServerManagerSettings,
    reconnect_running: AtomicBool,
    reconnect_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ServerManager {
    /// Create a manager over the given configuration.  No connections are
    /// opened until [`initialize_all`](Self::initialize_all).
    pub fn new(
        configs: HashMap<String, ToolServerConfig>,
        tokens: Arc<dyn TokenStore>,
        settings: ServerManagerSettings,
    ) -> Self {
        Self {
            configs: RwLock::new(configs),
            connections: DashMap::new(),
            inventory: DashMap::new(),
            tool_index: DashMap::new(),
            failures: Mutex::new(HashMap::new()),
            user_connections: Mutex::new(HashMap::new()),
            tokens,
            router: CallbackRouter::new(),
            sampling: std::sync::RwLock::new(None),
            settings,
            reconnect_running: AtomicBool::new(false),
            reconnect_task: Mutex::new(None),
        }
    }

    /// Install the host-level sampling handler answering server-initiated
    /// LLM requests.
    pub fn set_sampling_handler(&self, handler: Arc<dyn SamplingHandler>) {
        *self.sampling.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn sampling_handler(&self) -> Option<Arc<dyn SamplingHandler>> {
        self.sampling
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Open connections to every enabled configured server in parallel and
    /// run discovery for each one that connects.
    pub async fn initialize_all(&self) {
        let configs = self.configs.read().await.clone();
        let total = configs.len();
        tracing::info!(servers = total, "starting tool server initialization");

        let tasks = configs.into_iter().map(|(name, cfg)| async move {
            if !cfg.enabled {
                tracing::debug!(server = %name, "server disabled, skipping");
                return;
            }
            self.bring_up(&name, &cfg).await;
        });
        join_all(tasks).await;

        tracing::info!(
            connected = self.connections.len(),
            total,
            "tool server initialization complete"
        );
    }

    /// Connect one server, register the connection, and discover its tools.
    /// Failures are recorded; the server stays eligible for reconnect.
    async fn bring_up(&self, name: &str, cfg: &ToolServerConfig) {
        match self.connect_server(name, cfg).await {
            Ok(transport) => {
                self.connections.insert(name.to_owned(), transport);
                self.clear_failure(name).await;
                tracing::info!(server = %name, "tool server connected");
                if let Err(e) = self.discover_server(name).await {
                    tracing::warn!(server = %name, "discovery failed after connect: {e}");
                }
            }
            Err(e) => {
                tracing::error!(server = %name, "failed to connect: {e}");
                self.record_failure(name, e.to_string()).await;
            }
        }
    }

    /// Build a transport for one server according to its resolved transport
    /// kind.
    async fn connect_server(
        &self,
        name: &str,
        cfg: &ToolServerConfig,
    ) -> Result<Arc<dyn Transport>> {
        match cfg.resolve_transport() {
            TransportKind::Stdio => {
                let command = cfg.command.clone().ok_or_else(|| McpError::Spawn {
                    server: name.to_owned(),
                    reason: "stdio server has no command".into(),
                })?;

                // `${VAR}` references in the child env must all resolve, or
                // the server is skipped with a recorded failure.
                let mut env = HashMap::new();
                if let Some(raw_env) = &cfg.env {
                    for (key, value) in raw_env {
                        let resolved = resolve_env_refs(value).map_err(|e| {
                            tracing::error!(server = %name, key = %key, "env resolution failed: {e}");
                            McpError::from(e)
                        })?;
                        env.insert(key.clone(), resolved);
                    }
                }

                let cwd = cfg.cwd.as_ref().map(|c| {
                    let path = PathBuf::from(c);
                    if path.is_relative() {
                        match &self.settings.project_root {
                            Some(root) => root.join(path),
                            None => path,
                        }
                    } else {
                        path
                    }
                });

                let transport =
                    StdioTransport::spawn(name, &command, cwd, env, self.router.clone()).await?;
                transport.initialize().await?;
                Ok(Arc::new(transport))
            }

            kind @ (TransportKind::Http | TransportKind::Sse) => {
                let url = cfg.endpoint_url().ok_or_else(|| McpError::Transport {
                    server: name.to_owned(),
                    reason: "no URL provided for http/sse server".into(),
                })?;

                let auth = match &cfg.auth_token {
                    Some(raw) => HttpAuth::Bearer(resolve_env_refs(raw)?),
                    None => HttpAuth::None,
                };

                let transport = if kind == TransportKind::Sse {
                    HttpTransport::new_sse(name, url, auth, self.router.clone())?
                } else {
                    HttpTransport::new(name, url, auth, self.router.clone())?
                };
                transport.initialize().await?;
                Ok(Arc::new(transport))
            }
        }
    }

    /// Disconnect everything and stop the background reconnect task.
    pub async fn shutdown(&self) {
        self.stop_auto_reconnect().await;
        for entry in self.connections.iter() {
            entry.value().shutdown().await;
        }
        self.connections.clear();
        self.user_connections.lock().await.clear();
        tracing::info!("tool server manager shut down");
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Discover tools and prompts for one connected server.
    ///
    /// A tool-listing failure downgrades the server to an empty inventory
    /// and removes the connection entry so the reconnect path retries it.
    /// A prompt-listing failure is tolerated (not every server implements
    /// prompts).
    pub async fn discover_server(&self, name: &str) -> Result<()> {
        let conn = self
            .connections
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| McpError::ServerNotConnected {
                server: name.to_owned(),
            })?;

        let deadline = Duration::from_secs(self.settings.timeouts.discovery_secs);

        let tools = match timeout(deadline, conn.request("tools/list", json!({}))).await {
            Ok(Ok(value)) => {
                let listed: ListToolsResult = serde_json::from_value(value)?;
                listed.tools
            }
            Ok(Err(e)) => {
                tracing::error!(server = %name, "tool discovery failed: {e}");
                self.record_failure(name, format!("tool discovery failed: {e}")).await;
                self.drop_server_state(name).await;
                return Err(e);
            }
            Err(_) => {
                let reason = format!(
                    "tool discovery timed out after {}s",
                    self.settings.timeouts.discovery_secs
                );
                tracing::error!(server = %name, "{reason}");
                self.record_failure(name, reason).await;
                self.drop_server_state(name).await;
                return Err(McpError::Timeout {
                    server: name.to_owned(),
                    operation: "tools/list".into(),
                    seconds: self.settings.timeouts.discovery_secs,
                });
            }
        };

        let prompts = match timeout(deadline, conn.request("prompts/list", json!({}))).await {
            Ok(Ok(value)) => {
                serde_json::from_value::<ListPromptsResult>(value)
                    .map(|listed| listed.prompts)
                    .unwrap_or_default()
            }
            Ok(Err(e)) => {
                tracing::debug!(server = %name, "server does not support prompts: {e}");
                Vec::new()
            }
            Err(_) => {
                tracing::debug!(server = %name, "prompt discovery timed out");
                Vec::new()
            }
        };

        tracing::info!(
            server = %name,
            tools = tools.len(),
            prompts = prompts.len(),
            "discovery complete"
        );

        // Rebuild this server's slice of the tool index.
        self.tool_index.retain(|_, entry| entry.server != name);
        for tool in &tools {
            self.tool_index.insert(
                format!("{name}_{}", tool.name),
                ToolIndexEntry {
                    server: name.to_owned(),
                    tool: tool.clone(),
                },
            );
        }
        self.inventory
            .insert(name.to_owned(), ServerInventory { tools, prompts });

        Ok(())
    }

    /// Remove connection, inventory, and index entries for a server whose
    /// discovery failed.
    async fn drop_server_state(&self, name: &str) {
        if let Some((_, conn)) = self.connections.remove(name) {
            conn.shutdown().await;
        }
        self.inventory.insert(
            name.to_owned(),
            ServerInventory {
                tools: Vec::new(),
                prompts: Vec::new(),
            },
        );
        self.tool_index.retain(|_, entry| entry.server != name);
    }

    // -----------------------------------------------------------------------
    // Failure tracking and reconnect
    // -----------------------------------------------------------------------

    async fn record_failure(&self, name: &str, error: String) {
        let mut failures = self.failures.lock().await;
        match failures.get_mut(name) {
            Some(record) => {
                record.attempt_count += 1;
                record.last_attempt = Instant::now();
                record.last_error = error;
            }
            None => {
                failures.insert(
                    name.to_owned(),
                    FailureRecord {
                        first_failure: Utc::now(),
                        last_attempt: Instant::now(),
                        attempt_count: 1,
                        last_error: error,
                    },
                );
            }
        }
    }

    async fn clear_failure(&self, name: &str) {
        self.failures.lock().await.remove(name);
    }

    /// Snapshot of servers currently failed, for status endpoints.
    pub async fn get_failed_servers(&self) -> HashMap<String, FailureInfo> {
        self.failures
            .lock()
            .await
            .iter()
            .map(|(name, record)| {
                (
                    name.clone(),
                    FailureInfo {
                        first_failure: record.first_failure,
                        attempt_count: record.attempt_count,
                        last_error: record.last_error.clone(),
                    },
                )
            })
            .collect()
    }

    /// Attempt to reconnect failed servers.
    ///
    /// Without `force`, only servers whose exponential backoff delay has
    /// elapsed are attempted; the rest are reported under
    /// `skipped_backoff`.  With `force`, every failed server is attempted
    /// immediately.
    pub async fn reconnect(&self, force: bool) -> ReconnectReport {
        let mut report = ReconnectReport::default();

        let snapshot: Vec<(String, u32, Instant)> = {
            let failures = self.failures.lock().await;
            failures
                .iter()
                .map(|(name, record)| (name.clone(), record.attempt_count, record.last_attempt))
                .collect()
        };
        if snapshot.is_empty() {
            return report;
        }

        let configs = self.configs.read().await.clone();

        for (name, attempt_count, last_attempt) in snapshot {
            // Dropped from config, or reconnected by someone else meanwhile.
            if !configs.contains_key(&name) || self.connections.contains_key(&name) {
                self.clear_failure(&name).await;
                continue;
            }

            let delay = self.settings.reconnect.delay_for_attempt(attempt_count);
            let elapsed = last_attempt.elapsed();
            if !force && elapsed < delay {
                report.skipped_backoff.push(SkippedServer {
                    server: name,
                    wait_remaining_secs: (delay - elapsed).as_secs_f64(),
                    attempt_count,
                });
                continue;
            }

            report.attempted.push(name.clone());
            let cfg = configs[&name].clone();
            match self.connect_server(&name, &cfg).await {
                Ok(transport) => {
                    self.connections.insert(name.clone(), transport);
                    self.clear_failure(&name).await;
                    tracing::info!(server = %name, "reconnected to tool server");
                    if let Err(e) = self.discover_server(&name).await {
                        tracing::warn!(server = %name, "discovery failed after reconnect: {e}");
                    }
                    report.reconnected.push(name);
                }
                Err(e) => {
                    self.record_failure(&name, e.to_string()).await;
                    tracing::warn!(server = %name, "reconnect failed: {e}");
                    report.still_failed.push(name);
                }
            }
        }

        report
    }

    /// Start the background reconnect task, if enabled in settings.
    ///
    /// The task sleeps the base interval between sweeps and survives sweep
    /// errors; stop it with [`stop_auto_reconnect`](Self::stop_auto_reconnect).
    pub async fn start_auto_reconnect(self: &Arc<Self>) {
        if !self.settings.reconnect.auto_reconnect {
            tracing::info!("auto-reconnect is disabled");
            return;
        }
        if self.reconnect_running.swap(true, Ordering::SeqCst) {
            tracing::warn!("auto-reconnect task is already running");
            return;
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let interval = Duration::from_secs(manager.settings.reconnect.base_interval_secs);
            while manager.reconnect_running.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;

                if manager.failures.lock().await.is_empty() {
                    continue;
                }
                let report = manager.reconnect(false).await;
                if !report.reconnected.is_empty() {
                    tracing::info!(
                        reconnected = ?report.reconnected,
                        "auto-reconnect recovered servers"
                    );
                }
                if !report.still_failed.is_empty() {
                    tracing::debug!(
                        still_failed = report.still_failed.len(),
                        "auto-reconnect: servers still failed"
                    );
                }
            }
        });
        *self.reconnect_task.lock().await = Some(handle);
        tracing::info!("started auto-reconnect background task");
    }

    /// Stop the background reconnect task.
    pub async fn stop_auto_reconnect(&self) {
        self.reconnect_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reconnect_task.lock().await.take() {
            handle.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Per-user authentication
    // -----------------------------------------------------------------------

    fn auth_required_error(&self, server: &str, cfg: &ToolServerConfig, message: String) -> McpError {
        let oauth_start_url = (cfg.auth_type == AuthType::Oauth)
            .then(|| format!("/api/mcp/auth/{server}/oauth/start"));
        McpError::AuthenticationRequired {
            server_name: server.to_owned(),
            auth_type: cfg.auth_type.as_str().to_owned(),
            oauth_start_url,
            message,
        }
    }

    /// Get or create the caller's connection to a per-user server.
    async fn user_connection(
        &self,
        server: &str,
        cfg: &ToolServerConfig,
        user_email: &str,
    ) -> Result<Arc<dyn Transport>> {
        let cache_key = (user_email.to_lowercase(), server.to_owned());

        {
            let mut cache = self.user_connections.lock().await;
            if let Some(conn) = cache.get(&cache_key) {
                // A cached connection is only as good as the token behind it.
                if self.tokens.get_valid_token(user_email, server)?.is_some() {
                    return Ok(Arc::clone(conn));
                }
                tracing::debug!(server = %server, "token expired, invalidating cached client");
                cache.remove(&cache_key);
            }
        }

        let Some(token) = self.tokens.get_valid_token(user_email, server)? else {
            tracing::debug!(server = %server, "no valid token, authentication required");
            return Err(self.auth_required_error(
                server,
                cfg,
                format!("Server '{server}' requires authentication."),
            ));
        };

        let url = cfg.endpoint_url().ok_or_else(|| McpError::Transport {
            server: server.to_owned(),
            reason: "per-user auth requires a URL endpoint".into(),
        })?;

        let auth = match cfg.auth_type {
            AuthType::ApiKey => HttpAuth::Header {
                name: cfg.auth_header.clone().unwrap_or_else(|| "X-API-Key".into()),
                value: token.token_value,
            },
            _ => HttpAuth::Bearer(token.token_value),
        };

        let transport = if cfg.resolve_transport() == TransportKind::Sse {
            HttpTransport::new_sse(server, url, auth, self.router.clone())?
        } else {
            HttpTransport::new(server, url, auth, self.router.clone())?
        };
        transport.initialize().await?;
        let conn: Arc<dyn Transport> = Arc::new(transport);

        self.user_connections
            .lock()
            .await
            .insert(cache_key, Arc::clone(&conn));
        tracing::info!(
            server = %server,
            auth_type = %cfg.auth_type.as_str(),
            "created user-specific client"
        );
        Ok(conn)
    }

    /// Drop a user's cached connection (token revoked or expired).
    pub async fn invalidate_user_connection(&self, user_email: &str, server: &str) {
        let removed = self
            .user_connections
            .lock()
            .await
            .remove(&(user_email.to_lowercase(), server.to_owned()));
        if removed.is_some() {
            tracing::debug!(server = %server, "invalidated user client cache entry");
        }
    }

    async fn invalidate_user_connections_for_server(&self, server: &str) {
        self.user_connections
            .lock()
            .await
            .retain(|(_, s), _| s != server);
    }

    // -----------------------------------------------------------------------
    // Tool invocation
    // -----------------------------------------------------------------------

    /// Call one tool with a bounded timeout and return the raw result.
    ///
    /// `tool_call_id` is used as the progress token so the server's progress
    /// notifications can be routed back to this call.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        user_email: Option<&str>,
        tool_call_id: Option<&str>,
    ) -> Result<CallToolResult> {
        let cfg = self
            .configs
            .read()
            .await
            .get(server)
            .cloned()
            .ok_or_else(|| McpError::ServerNotConnected {
                server: server.to_owned(),
            })?;

        let conn = if cfg.auth_type.is_per_user() {
            match user_email {
                Some(user) => self.user_connection(server, &cfg, user).await?,
                None => {
                    return Err(self.auth_required_error(
                        server,
                        &cfg,
                        format!("Server '{server}' requires authentication but no user context."),
                    ));
                }
            }
        } else {
            self.connections
                .get(server)
                .map(|e| Arc::clone(e.value()))
                .ok_or_else(|| McpError::ServerNotConnected {
                    server: server.to_owned(),
                })?
        };

        let mut params = json!({"name": tool, "arguments": arguments});
        if let Some(id) = tool_call_id {
            params["_meta"] = json!({"progressToken": id});
        }

        let seconds = self.settings.timeouts.call_secs;
        match timeout(Duration::from_secs(seconds), conn.request("tools/call", params)).await {
            Ok(Ok(value)) => {
                tracing::info!(server = %server, tool = %tool, "tool call succeeded");
                Ok(serde_json::from_value(value)?)
            }
            Ok(Err(e)) => {
                tracing::error!(server = %server, tool = %tool, "tool call failed: {e}");
                Err(e)
            }
            Err(_) => {
                let reason =
                    format!("Tool call '{tool}' on server '{server}' timed out after {seconds}s");
                tracing::error!("{reason}");
                self.record_failure(server, reason).await;
                Err(McpError::Timeout {
                    server: server.to_owned(),
                    operation: format!("tools/call {tool}"),
                    seconds,
                })
            }
        }
    }

    /// Execute a fully-qualified tool call end to end: resolve it through
    /// the index, install callback routing, invoke, and normalize.
    ///
    /// Returns `Err` only for [`McpError::AuthenticationRequired`]; every
    /// other failure becomes an unsuccessful [`ToolResult`] so the agent
    /// loop can continue.
    pub async fn execute_tool(
        &self,
        tool_call: &ToolCall,
        user_email: Option<&str>,
        events: Option<Arc<dyn EventSink>>,
        elicitation: Option<Arc<dyn ElicitationHandler>>,
    ) -> Result<ToolResult> {
        let Some((server, actual_tool)) = self
            .tool_index
            .get(&tool_call.name)
            .map(|entry| (entry.server.clone(), entry.tool.name.clone()))
        else {
            return Ok(ToolResult::failed(
                &tool_call.id,
                format!("Tool not found: {}", tool_call.name),
                format!("Tool not found: {}", tool_call.name),
            ));
        };

        // Routing entry lives exactly as long as the call; the guard removes
        // it on every exit path.
        let _guard = self.router.register(
            server.clone(),
            CallSinks {
                tool_call_id: tool_call.id.clone(),
                tool_name: tool_call.name.clone(),
                events,
                elicitation,
                sampling: self.sampling_handler(),
            },
        );

        let raw = match self
            .call_tool(
                &server,
                &actual_tool,
                tool_call.arguments.clone(),
                user_email,
                Some(&tool_call.id),
            )
            .await
        {
            Ok(raw) => raw,
            Err(e) if e.is_auth_required() => return Err(e),
            Err(e) => {
                return Ok(ToolResult::failed(
                    &tool_call.id,
                    format!("Error executing tool: {e}"),
                    e.to_string(),
                ));
            }
        };

        let normalized = normalize_tool_result(&tool_call.name, &raw);
        let content = serde_json::to_string(&normalized.payload)?;

        if raw.is_error {
            return Ok(ToolResult {
                tool_call_id: tool_call.id.clone(),
                content,
                success: false,
                error: Some(format!("{} reported an error", tool_call.name)),
                artifacts: normalized.artifacts,
                display_config: normalized.display,
                meta_data: normalized.meta_data,
            });
        }

        Ok(ToolResult {
            tool_call_id: tool_call.id.clone(),
            content,
            success: true,
            error: None,
            artifacts: normalized.artifacts,
            display_config: normalized.display,
            meta_data: normalized.meta_data,
        })
    }

    // -----------------------------------------------------------------------
    // Prompts
    // -----------------------------------------------------------------------

    /// Fetch a prompt from a server.
    pub async fn get_prompt(
        &self,
        server: &str,
        prompt: &str,
        arguments: Option<Value>,
    ) -> Result<GetPromptResult> {
        let conn = self
            .connections
            .get(server)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| McpError::ServerNotConnected {
                server: server.to_owned(),
            })?;

        let mut params = json!({"name": prompt});
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let value = conn.request("prompts/get", params).await?;
        tracing::info!(server = %server, prompt = %prompt, "prompt retrieved");
        Ok(serde_json::from_value(value)?)
    }

    /// Discovered prompts for the selected servers, keyed by
    /// `"{server}_{prompt}"`.
    pub fn get_available_prompts(
        &self,
        server_names: &[String],
    ) -> HashMap<String, PromptDescriptor> {
        let mut prompts = HashMap::new();
        for name in server_names {
            if let Some(inventory) = self.inventory.get(name) {
                for prompt in &inventory.prompts {
                    prompts.insert(format!("{name}_{}", prompt.name), prompt.clone());
                }
            }
        }
        prompts
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// All configured server names.
    pub async fn get_available_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Required group labels for a server.
    pub async fn get_server_groups(&self, server: &str) -> Vec<String> {
        self.configs
            .read()
            .await
            .get(server)
            .map(|cfg| cfg.groups.clone())
            .unwrap_or_default()
    }

    /// Servers the user may use: enabled, and either ungrouped or sharing a
    /// group with the user according to the membership predicate.
    pub async fn get_authorized_servers<F, Fut>(
        &self,
        user_email: &str,
        is_member: F,
    ) -> Vec<String>
    where
        F: Fn(String, String) -> Fut,
        Fut: Future<Output = bool>,
    {
        let configs = self.configs.read().await.clone();
        let mut authorized = Vec::new();

        for (name, cfg) in &configs {
            if !cfg.enabled {
                continue;
            }
            if cfg.groups.is_empty() {
                authorized.push(name.clone());
                continue;
            }
            for group in &cfg.groups {
                if is_member(user_email.to_owned(), group.clone()).await {
                    authorized.push(name.clone());
                    break;
                }
            }
        }

        authorized.sort();
        authorized
    }

    /// Every discovered fully-qualified tool name.
    pub fn get_available_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tool_index
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Descriptor for one fully-qualified tool name.
    pub fn tool_descriptor(&self, full_name: &str) -> Option<ToolDescriptor> {
        self.tool_index
            .get(full_name)
            .map(|entry| entry.tool.clone())
    }

    /// OpenAI-style function schemas for the requested tools.  Unknown
    /// names are skipped.
    pub fn get_tools_schema(&self, tool_names: &[String]) -> Vec<Value> {
        let mut schemas = Vec::new();
        for requested in tool_names {
            let Some(entry) = self.tool_index.get(requested) else {
                tracing::warn!(tool = %requested, "requested tool not in discovery index");
                continue;
            };
            schemas.push(json!({
                "type": "function",
                "function": {
                    "name": requested,
                    "description": entry.tool.description.clone().unwrap_or_default(),
                    "parameters": if entry.tool.input_schema.is_null() {
                        json!({})
                    } else {
                        entry.tool.input_schema.clone()
                    },
                },
            }));
        }
        schemas
    }

    /// Whether the owning server's configuration lists this tool (by base
    /// name) as requiring approval.
    pub async fn tool_requires_admin_approval(&self, full_name: &str) -> bool {
        let Some((server, base_name)) = self
            .tool_index
            .get(full_name)
            .map(|entry| (entry.server.clone(), entry.tool.name.clone()))
        else {
            return false;
        };
        self.configs
            .read()
            .await
            .get(&server)
            .is_some_and(|cfg| cfg.require_approval.contains(&base_name))
    }

    /// Structured digest of every discovered server and its tools, in the
    /// shape injected as `_mcp_data` for planning tools.
    pub async fn servers_digest(&self) -> Value {
        let configs = self.configs.read().await;
        let mut servers = Vec::new();

        let mut names: Vec<String> = self
            .inventory
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();

        for name in names {
            let Some(inventory) = self.inventory.get(&name) else {
                continue;
            };
            let description = configs
                .get(&name)
                .and_then(|cfg| {
                    cfg.description
                        .clone()
                        .or_else(|| cfg.short_description.clone())
                })
                .unwrap_or_default();

            let tools: Vec<Value> = inventory
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": format!("{name}_{}", tool.name),
                        "description": tool.description.clone().unwrap_or_default(),
                        "parameters": tool.input_schema.clone(),
                    })
                })
                .collect();

            servers.push(json!({
                "server_name": name,
                "description": description,
                "tools": tools,
            }));
        }

        json!({"available_servers": servers})
    }

    // -----------------------------------------------------------------------
    // Config reload
    // -----------------------------------------------------------------------

    /// Apply a freshly parsed server configuration.
    ///
    /// Removed servers are disconnected, added servers are brought up,
    /// changed servers are torn down and brought up again (with their
    /// per-user clients invalidated when the endpoint or auth surface
    /// changed), and unchanged servers are left alone.
    pub async fn apply_config(&self, next: HashMap<String, ToolServerConfig>) -> ConfigDiff {
        let (diff, auth_changed) = {
            let current = self.configs.read().await;
            let diff = diff_server_configs(&current, &next);
            let auth_changed: Vec<String> = diff
                .changed
                .iter()
                .filter(|name| next[*name].auth_surface_changed(&current[*name]))
                .cloned()
                .collect();
            (diff, auth_changed)
        };

        for name in &diff.removed {
            if let Some((_, conn)) = self.connections.remove(name) {
                conn.shutdown().await;
            }
            self.inventory.remove(name);
            self.tool_index.retain(|_, entry| entry.server != *name);
            self.clear_failure(name).await;
            self.invalidate_user_connections_for_server(name).await;
        }

        *self.configs.write().await = next.clone();

        for name in &diff.changed {
            if let Some((_, conn)) = self.connections.remove(name) {
                conn.shutdown().await;
            }
            self.inventory.remove(name);
            self.tool_index.retain(|_, entry| entry.server != *name);
            self.clear_failure(name).await;
            if auth_changed.contains(name) {
                self.invalidate_user_connections_for_server(name).await;
            }
            let cfg = &next[name];
            if cfg.enabled {
                self.bring_up(name, cfg).await;
            }
        }

        for name in &diff.added {
            let cfg = &next[name];
            if cfg.enabled {
                self.bring_up(name, cfg).await;
            }
        }

        tracing::info!(
            added = ?diff.added,
            removed = ?diff.removed,
            changed = ?diff.changed,
            unchanged = diff.unchanged.len(),
            "server config reloaded"
        );
        diff
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
