// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use parley_tools::Tool;

use crate::manager::McpServer;
use crate::protocol::McpToolDef;

/// Adapter exposing a remote MCP tool through the local [`Tool`] contract.
///
/// Registered under the namespaced name `server__toolname`.  A remote
/// `isError` result is surfaced as a tool error carrying the joined text, so
/// the turn engine converts it into an error tool_result like any other
/// tool failure.
pub struct McpToolProxy {
    server: Arc<McpServer>,
    def: McpToolDef,
    qualified_name: String,
}

impl McpToolProxy {
    pub fn new(server: Arc<McpServer>, def: McpToolDef) -> Self {
        let qualified_name = format!("{}__{}", server.name, def.name);
        Self { server, def, qualified_name }
    }
}

#[async_trait]
impl Tool for McpToolProxy {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.def.description
    }

    fn input_schema(&self) -> Value {
        self.def.input_schema.clone()
    }

    async fn execute(&self, input: &Value) -> anyhow::Result<String> {
        debug!(tool = %self.qualified_name, "MCP tool call");
        let result = self.server.call_tool(&self.def.name, input.clone()).await?;
        let output = result.joined_text();
        if result.is_error {
            anyhow::bail!(output);
        }
        debug!(tool = %self.qualified_name, chars = output.len(), "MCP tool result");
        Ok(output)
    }
}
