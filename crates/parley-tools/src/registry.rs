// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use crate::Tool;

/// A tool schema in the generic form handed to provider conversion.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools, keyed by name.
///
/// Built once at startup (built-ins plus MCP proxies) and shared immutably;
/// parallel tool execution is safe because nothing mutates after
/// registration.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.input_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, input: &Value) -> anyhow::Result<String> {
            Ok(format!("echo:{input}"))
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        assert!(reg.get("echo").is_some());
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn names_are_sorted() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "zeta" });
        reg.register(EchoTool { name: "alpha" });
        assert_eq!(reg.names(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn schemas_are_sorted_and_complete() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "b" });
        reg.register(EchoTool { name: "a" });
        let schemas = reg.schemas();
        assert_eq!(schemas[0].name, "a");
        assert_eq!(schemas[1].name, "b");
        assert_eq!(schemas[0].description, "echoes its input");
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t" });
        reg.register(EchoTool { name: "t" });
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn execute_through_registry() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        let tool = reg.get("echo").unwrap();
        let out = tool.execute(&json!({ "x": 1 })).await.unwrap();
        assert!(out.starts_with("echo:"));
    }

    #[test]
    fn default_predict_touched_paths_reads_path_field() {
        let tool = EchoTool { name: "t" };
        assert_eq!(tool.predict_touched_paths(&json!({ "path": "a/b" })), vec!["a/b"]);
        assert!(tool.predict_touched_paths(&json!({})).is_empty());
        assert!(tool.predict_touched_paths(&json!({ "path": "  " })).is_empty());
    }
}
