// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use parley_config::{McpServerConfig, McpTransportKind};
use parley_tools::Tool;

use crate::protocol::{self, McpToolDef, ToolCallResult, ToolsListResult};
use crate::proxy::McpToolProxy;
use crate::transport::{HttpTransport, McpTransport, StdioTransport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server is down: {0}")]
    ServerDown(String),
}

/// One connected MCP server: transport plus the tools it advertised.
pub struct McpServer {
    pub name: String,
    pub tools: Vec<McpToolDef>,
    transport: Box<dyn McpTransport>,
}

impl McpServer {
    /// Spawn/connect, run the initialize handshake and discover tools.
    async fn initialize(name: &str, config: &McpServerConfig) -> Result<Self, McpError> {
        let transport: Box<dyn McpTransport> = match config.transport {
            McpTransportKind::Stdio => Box::new(StdioTransport::spawn(config)?),
            McpTransportKind::Http => {
                let url = config.url.clone().ok_or_else(|| {
                    McpError::Protocol("http transport requires a url".into())
                })?;
                Box::new(HttpTransport::connect(url))
            }
        };

        let resp = transport
            .send_request("initialize", Some(protocol::initialize_params()))
            .await?;
        if let Err(err) = resp.into_result() {
            return Err(McpError::Protocol(format!("initialize failed: {err}")));
        }
        transport
            .send_notification("notifications/initialized")
            .await?;

        let tools_resp = transport.send_request("tools/list", None).await?;
        let tools = match tools_resp.into_result() {
            Ok(value) => match serde_json::from_value::<ToolsListResult>(value) {
                Ok(r) => r.tools,
                Err(e) => {
                    warn!(server = name, error = %e, "failed to parse tools/list result");
                    Vec::new()
                }
            },
            Err(err) => {
                warn!(server = name, %err, "tools/list returned error, server has no tools");
                Vec::new()
            }
        };

        info!(server = name, tool_count = tools.len(), "MCP server initialized");
        Ok(Self {
            name: name.to_string(),
            tools,
            transport,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Invoke one of this server's tools.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        if !self.transport.is_alive() {
            return Err(McpError::ServerDown(self.name.clone()));
        }
        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
        let resp = self.transport.send_request("tools/call", Some(params)).await?;
        let value = resp
            .into_result()
            .map_err(|err| McpError::Protocol(format!("tools/call failed: {err}")))?;
        serde_json::from_value::<ToolCallResult>(value)
            .map_err(|e| McpError::Protocol(format!("failed to parse tools/call result: {e}")))
    }

    async fn shutdown(&self) {
        info!(server = %self.name, "shutting down MCP server");
        self.transport.shutdown().await;
    }
}

/// Connects and supervises all configured MCP servers.
pub struct McpManager {
    servers: Vec<Arc<McpServer>>,
}

impl McpManager {
    pub fn empty() -> Self {
        Self { servers: Vec::new() }
    }

    /// Connect every configured server and return the manager together with
    /// namespaced tool proxies (`server__toolname`) ready for registration.
    ///
    /// A server that fails to start is logged and skipped — its tools are
    /// simply absent.
    pub async fn connect_all(
        configs: &HashMap<String, McpServerConfig>,
    ) -> (Self, Vec<Arc<dyn Tool>>) {
        let mut servers: Vec<Arc<McpServer>> = Vec::new();
        let mut proxies: Vec<Arc<dyn Tool>> = Vec::new();

        let mut names: Vec<&String> = configs.keys().collect();
        names.sort();
        for name in names {
            let config = &configs[name];
            match McpServer::initialize(name, config).await {
                Ok(server) => {
                    let server = Arc::new(server);
                    for def in &server.tools {
                        proxies.push(Arc::new(McpToolProxy::new(server.clone(), def.clone()))
                            as Arc<dyn Tool>);
                    }
                    servers.push(server);
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "failed to connect MCP server, skipping");
                }
            }
        }

        if !servers.is_empty() {
            info!(
                servers = servers.len(),
                tools = proxies.len(),
                "MCP manager ready"
            );
        }
        (Self { servers }, proxies)
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Shut down all servers concurrently.  Each shutdown is bounded by the
    /// transport's 5-second grace window; partial shutdown is accepted.
    pub async fn shutdown(&self) {
        let futs: Vec<_> = self.servers.iter().map(|s| s.shutdown()).collect();
        futures::future::join_all(futs).await;
    }
}
