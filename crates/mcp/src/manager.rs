//! MCP manager — the tool hub. Holds all MCP server connections plus
//! in-process "fast-lane" tools, and orchestrates discovery, hot-reload,
//! and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use jarvis_domain::config::{McpConfig, McpServerConfig, McpTransportKind};
use crate::protocol::{self, McpToolDef, ToolCallResult, ToolsListResult};
use crate::transport::{HttpTransport, McpTransport, SseTransport, StdioTransport, TransportError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpServer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An MCP server connection (one per configured server).
pub struct McpServer {
    /// Server ID from config.
    pub id: String,
    /// Tools discovered via `tools/list`.
    pub tools: Vec<McpToolDef>,
    /// Handle to the running process or HTTP/SSE connection.
    transport: Box<dyn McpTransport>,
}

impl McpServer {
    /// Initialize a server: spawn the process (or connect over HTTP/SSE),
    /// perform the MCP handshake, and discover tools.
    async fn initialize(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport: Box<dyn McpTransport> = match config.transport {
            McpTransportKind::Stdio => {
                let t = StdioTransport::spawn(config).map_err(McpError::Transport)?;
                Box::new(t)
            }
            McpTransportKind::Sse => {
                let url = config.url.clone().ok_or_else(|| {
                    McpError::Protocol(format!(
                        "server '{}' uses sse transport but has no url configured",
                        config.id
                    ))
                })?;
                Box::new(SseTransport::new(url))
            }
            McpTransportKind::HttpJsonRpc
            | McpTransportKind::HttpStream
            | McpTransportKind::HttpStreamSession
            | McpTransportKind::Auto => {
                let url = config.url.clone().ok_or_else(|| {
                    McpError::Protocol(format!(
                        "server '{}' uses an http transport but has no url configured",
                        config.id
                    ))
                })?;
                Box::new(HttpTransport::new(url))
            }
        };

        // Step 1: Send `initialize` request.
        let init_params = protocol::initialize_params();
        let params_value = serde_json::to_value(&init_params)
            .map_err(|e| McpError::Protocol(format!("failed to serialize initialize params: {e}")))?;

        let resp = transport
            .send_request("initialize", Some(params_value))
            .await
            .map_err(McpError::Transport)?;

        if resp.is_error() {
            let err = resp.error.unwrap();
            return Err(McpError::Protocol(format!(
                "initialize failed: {err}"
            )));
        }

        tracing::debug!(server_id = %config.id, "MCP initialize response received");

        // Step 2: Send `notifications/initialized` notification.
        transport
            .send_notification("notifications/initialized")
            .await
            .map_err(McpError::Transport)?;

        tracing::debug!(server_id = %config.id, "sent notifications/initialized");

        // Step 3: Discover tools via `tools/list`.
        let tools_resp = transport
            .send_request("tools/list", None)
            .await
            .map_err(McpError::Transport)?;

        let tools = if tools_resp.is_error() {
            tracing::warn!(
                server_id = %config.id,
                "tools/list returned error, server will have no tools"
            );
            Vec::new()
        } else {
            let result_value = tools_resp.result.unwrap_or(Value::Null);
            match serde_json::from_value::<ToolsListResult>(result_value) {
                Ok(r) => r.tools,
                Err(e) => {
                    tracing::warn!(
                        server_id = %config.id,
                        error = %e,
                        "failed to parse tools/list result"
                    );
                    Vec::new()
                }
            }
        };

        tracing::info!(
            server_id = %config.id,
            tool_count = tools.len(),
            "MCP server initialized"
        );

        Ok(Self {
            id: config.id.clone(),
            tools,
            transport,
        })
    }

    /// Check if the server's transport is still alive.
    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    fn has_tool(&self, tool_name: &str) -> bool {
        self.tools.iter().any(|t| t.name == tool_name)
    }

    /// Call a tool on this server.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        if !self.transport.is_alive() {
            return Err(McpError::ServerDown(self.id.clone()));
        }

        // Fail-closed: don't forward calls for tools this server never
        // advertised, even if the backend process is alive (e.g. mid-reload).
        if !self.has_tool(tool_name) {
            return Err(McpError::ToolNotFound(tool_name.to_string()));
        }

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments
        });

        let resp = self
            .transport
            .send_request("tools/call", Some(params))
            .await
            .map_err(McpError::Transport)?;

        if resp.is_error() {
            let err = resp.error.unwrap();
            return Err(McpError::Protocol(format!(
                "tools/call failed: {err}"
            )));
        }

        let result_value = resp.result.unwrap_or(Value::Null);
        serde_json::from_value::<ToolCallResult>(result_value).map_err(|e| {
            McpError::Protocol(format!(
                "failed to parse tools/call result: {e}"
            ))
        })
    }

    /// Gracefully shut down the server.
    async fn shutdown(&self) {
        tracing::info!(server_id = %self.id, "shutting down MCP server");
        self.transport.shutdown().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fast lane — in-process tools that bypass transport entirely.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An in-process tool handler, registered once at startup and invoked
/// directly (no JSON-RPC round trip). Used for file I/O, memory snapshots,
/// workspace events, and other tools that don't warrant a full MCP backend.
#[async_trait]
pub trait FastLaneTool: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<ToolCallResult, McpError>;
}

struct FastLaneEntry {
    def: McpToolDef,
    handler: Arc<dyn FastLaneTool>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpManager (the Tool Hub)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The registry state swapped atomically on reload. Callers in the middle
/// of `call_tool` always observe either the old or the new registry in
/// full — never a half-cleared state.
struct Registry {
    servers: HashMap<String, McpServer>,
    fast_lane: HashMap<String, FastLaneEntry>,
    /// sha256 of the sorted `server_id:tool_name` routing table, used to
    /// detect whether a reload actually changed anything worth re-publishing.
    version_hash: String,
}

fn compute_version_hash(
    servers: &HashMap<String, McpServer>,
    fast_lane: &HashMap<String, FastLaneEntry>,
) -> String {
    let mut entries: Vec<String> = servers
        .values()
        .flat_map(|s| s.tools.iter().map(move |t| format!("{}:{}", s.id, t.name)))
        .chain(fast_lane.keys().map(|name| format!("fast-lane:{name}")))
        .collect();
    entries.sort();

    let mut hasher = Sha256::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Manager that holds all MCP server connections and fast-lane tools.
///
/// Tool discovery results are cached in an `RwLock<Registry>` so concurrent
/// `call_tool`s never block each other, but `refresh()` can still swap the
/// whole registry out atomically for hot reload.
pub struct McpManager {
    registry: RwLock<Registry>,
    /// Retained so `refresh()` can re-initialize every backend from scratch.
    configs: Vec<McpServerConfig>,
}

impl McpManager {
    /// Create an empty manager (no MCP servers configured).
    pub fn empty() -> Self {
        Self {
            registry: RwLock::new(Registry {
                servers: HashMap::new(),
                fast_lane: HashMap::new(),
                version_hash: compute_version_hash(&HashMap::new(), &HashMap::new()),
            }),
            configs: Vec::new(),
        }
    }

    /// Initialize from config: spawn processes, send initialize, discover tools.
    ///
    /// Servers that fail to initialize are logged and skipped (not fatal).
    pub async fn from_config(config: &McpConfig) -> Self {
        let configs = config.effective_servers();
        let servers = Self::initialize_servers(&configs).await;
        let fast_lane = HashMap::new();
        let version_hash = compute_version_hash(&servers, &fast_lane);

        if !servers.is_empty() {
            tracing::info!(count = servers.len(), %version_hash, "MCP manager ready");
        }

        Self {
            registry: RwLock::new(Registry {
                servers,
                fast_lane,
                version_hash,
            }),
            configs,
        }
    }

    async fn initialize_servers(configs: &[McpServerConfig]) -> HashMap<String, McpServer> {
        let mut servers = HashMap::new();
        for server_config in configs {
            tracing::info!(
                server_id = %server_config.id,
                command = %server_config.command,
                transport = ?server_config.transport,
                "initializing MCP server"
            );

            match McpServer::initialize(server_config).await {
                Ok(server) => {
                    servers.insert(server_config.id.clone(), server);
                }
                Err(e) => {
                    tracing::warn!(
                        server_id = %server_config.id,
                        error = %e,
                        "failed to initialize MCP server, skipping"
                    );
                }
            }
        }
        servers
    }

    /// Register a fast-lane (in-process) tool. Safe to call at any time —
    /// guarded by the same write lock `reload_registry` swaps under.
    pub async fn register_fast_lane(&self, def: McpToolDef, handler: Arc<dyn FastLaneTool>) {
        let mut registry = self.registry.write().await;
        registry.fast_lane.insert(def.name.clone(), FastLaneEntry { def, handler });
        registry.version_hash = compute_version_hash(&registry.servers, &registry.fast_lane);
    }

    /// Hot-reload: re-initialize every configured backend and fast-lane
    /// tool, then atomically swap in the new registry. Idempotent — if the
    /// routing table is unchanged, the version hash stays the same.
    ///
    /// Concurrent `call_tool` calls block on the write lock for the
    /// duration of the swap only; the old registry stays servable for every
    /// call in flight until then (never half-cleared).
    pub async fn refresh(&self) -> String {
        self.reload_registry().await
    }

    /// Alias for [`refresh`], matching the "reload_registry" name used in
    /// admin tooling.
    pub async fn reload_registry(&self) -> String {
        let servers = Self::initialize_servers(&self.configs).await;

        let mut registry = self.registry.write().await;
        let fast_lane = std::mem::take(&mut registry.fast_lane);
        tracing::debug!(count = fast_lane.len(), "re-registering fast-lane tools on reload");

        let new_hash = compute_version_hash(&servers, &fast_lane);
        let changed = registry.version_hash != new_hash;
        *registry = Registry {
            servers,
            fast_lane,
            version_hash: new_hash.clone(),
        };
        drop(registry);

        if changed {
            tracing::info!(version_hash = %new_hash, "MCP tool registry changed on reload");
        } else {
            tracing::debug!(version_hash = %new_hash, "MCP tool registry unchanged on reload");
        }
        new_hash
    }

    /// The current registry version hash (changes only when the routing
    /// table actually changes across a reload).
    pub async fn version_hash(&self) -> String {
        self.registry.read().await.version_hash.clone()
    }

    /// Get all discovered tools across all servers and fast-lane handlers.
    ///
    /// Returns tuples of `(server_id, tool_def)`; fast-lane tools report
    /// their server id as `"fast-lane"`.
    pub async fn list_tools(&self) -> Vec<(String, McpToolDef)> {
        let registry = self.registry.read().await;
        let mut out: Vec<(String, McpToolDef)> = registry
            .servers
            .values()
            .filter(|s| s.is_alive())
            .flat_map(|server| {
                server
                    .tools
                    .iter()
                    .map(move |tool| (server.id.clone(), tool.clone()))
            })
            .collect();
        out.extend(
            registry
                .fast_lane
                .values()
                .map(|entry| ("fast-lane".to_string(), entry.def.clone())),
        );
        out
    }

    /// Call a tool on a specific server, or on the fast lane when
    /// `server_id == "fast-lane"`.
    ///
    /// Fail-closed: an absent backend or an unadvertised tool is always an
    /// error, never silently treated as a no-op success.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        if server_id == "fast-lane" {
            let handler = {
                let registry = self.registry.read().await;
                registry
                    .fast_lane
                    .get(tool_name)
                    .ok_or_else(|| McpError::ToolNotFound(tool_name.to_string()))?
                    .handler
                    .clone()
            };
            return handler.call(arguments).await;
        }

        let registry = self.registry.read().await;
        let server = registry
            .servers
            .get(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;

        server.call_tool(tool_name, arguments).await
    }

    /// Which backend currently advertises a given tool name, if any.
    /// Fast-lane entries win ties (a fast-lane tool shadows a remote one of
    /// the same name, matching registration order at `initialize()`).
    pub async fn get_mcp_for_tool(&self, tool_name: &str) -> Option<String> {
        let registry = self.registry.read().await;
        if registry.fast_lane.contains_key(tool_name) {
            return Some("fast-lane".to_string());
        }
        registry
            .servers
            .values()
            .find(|s| s.is_alive() && s.has_tool(tool_name))
            .map(|s| s.id.clone())
    }

    /// List all connected backend ids, including `"fast-lane"` if any
    /// in-process tools are registered. Diagnostics only.
    pub async fn list_mcps(&self) -> Vec<String> {
        let registry = self.registry.read().await;
        let mut ids: Vec<String> = registry.servers.keys().cloned().collect();
        if !registry.fast_lane.is_empty() {
            ids.push("fast-lane".to_string());
        }
        ids.sort();
        ids
    }

    /// Resolve a tool name to its backend and dispatch in one step. The
    /// entry point callers outside this crate should use when they only
    /// know the tool name, not which backend advertises it — mirrors the
    /// hub's `call_tool(name, args)` contract.
    pub async fn call_tool_by_name(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        let server_id = self
            .get_mcp_for_tool(tool_name)
            .await
            .ok_or_else(|| McpError::ToolNotFound(tool_name.to_string()))?;
        self.call_tool(&server_id, tool_name, arguments).await
    }

    /// Return the number of connected servers.
    pub async fn server_count(&self) -> usize {
        self.registry.read().await.servers.len()
    }

    /// Return the total number of discovered tools across all alive servers
    /// and registered fast-lane tools.
    pub async fn tool_count(&self) -> usize {
        let registry = self.registry.read().await;
        let remote: usize = registry
            .servers
            .values()
            .filter(|s| s.is_alive())
            .map(|s| s.tools.len())
            .sum();
        remote + registry.fast_lane.len()
    }

    /// Check if there are any configured servers or fast-lane tools.
    pub async fn is_empty(&self) -> bool {
        let registry = self.registry.read().await;
        registry.servers.is_empty() && registry.fast_lane.is_empty()
    }

    /// Gracefully shut down all servers concurrently.
    pub async fn shutdown(&self) {
        let registry = self.registry.read().await;
        let futs: Vec<_> = registry.servers.values().map(|s| s.shutdown()).collect();
        futures_util::future::join_all(futs).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Errors specific to MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server not found: {0}")]
    ServerNotFound(String),

    #[error("MCP server is down: {0}")]
    ServerDown(String),

    #[error("tool '{0}' not found")]
    ToolNotFound(String),
}

impl From<McpError> for jarvis_domain::error::Error {
    fn from(e: McpError) -> Self {
        let message = e.to_string();
        match e {
            McpError::Transport(TransportError::Timeout) => {
                jarvis_domain::error::Error::Timeout(message)
            }
            McpError::ServerNotFound(_) | McpError::ToolNotFound(_) => {
                jarvis_domain::error::Error::NotFound(message)
            }
            _ => jarvis_domain::error::Error::Transport(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl FastLaneTool for EchoTool {
        async fn call(&self, arguments: Value) -> Result<ToolCallResult, McpError> {
            Ok(ToolCallResult {
                content: vec![crate::protocol::ToolCallContent {
                    content_type: "text".into(),
                    text: arguments.to_string(),
                }],
                is_error: false,
            })
        }
    }

    #[tokio::test]
    async fn empty_manager_has_no_tools() {
        let manager = McpManager::empty();
        assert!(manager.is_empty().await);
        assert_eq!(manager.tool_count().await, 0);
    }

    #[tokio::test]
    async fn fast_lane_tool_is_routed_and_counted() {
        let manager = McpManager::empty();
        manager
            .register_fast_lane(
                McpToolDef {
                    name: "echo".into(),
                    description: "echoes its arguments".into(),
                    input_schema: serde_json::json!({"type": "object"}),
                },
                Arc::new(EchoTool),
            )
            .await;

        assert_eq!(manager.tool_count().await, 1);
        let result = manager
            .call_tool("fast-lane", "echo", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert!(result.content[0].text.contains("\"x\":1"));
    }

    #[tokio::test]
    async fn call_tool_on_missing_server_fails_closed() {
        let manager = McpManager::empty();
        let err = manager
            .call_tool("nonexistent", "anything", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound(_)));
    }

    #[tokio::test]
    async fn call_tool_on_fast_lane_missing_tool_fails_closed() {
        let manager = McpManager::empty();
        let err = manager
            .call_tool("fast-lane", "nope", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn refresh_on_empty_config_is_a_noop_and_keeps_hash_stable() {
        let manager = McpManager::empty();
        let before = manager.version_hash().await;
        let after = manager.refresh().await;
        assert_eq!(before, after);
    }
}
