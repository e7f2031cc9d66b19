use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use tessera_core::config::ToolsConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Tool;
use tessera_core::types::{ToolContext, ToolResult};

use crate::kind::ToolKind;

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Resolve a tool kind to its implementation.
    pub fn resolve(&self, kind: ToolKind) -> Result<Arc<dyn Tool>> {
        self.get(kind.name())
            .ok_or_else(|| TesseraError::ToolNotFound(kind.name().to_string()))
    }

    /// List all registered tools, sorted by name.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| TesseraError::ToolNotFound(name.to_string()))?;

        debug!(tool = name, node_id = %ctx.node_id, "Executing tool");
        let timeout = std::time::Duration::from_secs(tool.timeout_secs());

        match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(TesseraError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins(config: &ToolsConfig) -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::CreateFileTool);
        registry.register(crate::builtin::ReadFileTool::new(config.max_read_chars));
        registry.register(crate::builtin::FetchUrlTool::new(
            config.fetch_timeout_secs,
            config.max_fetch_chars,
        ));
        registry.register(crate::builtin::ExtractUrlTextTool::new(
            config.fetch_timeout_secs,
            config.max_fetch_chars,
        ));
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;

    #[test]
    fn test_builtins_cover_registry_kinds() {
        let registry = ToolRegistry::with_builtins(&ToolsConfig::default());
        for kind in ToolKind::ALL {
            assert_eq!(registry.get(kind.name()).is_some(), !kind.is_intrinsic(), "{kind}");
        }
        assert_eq!(
            registry.list(),
            vec!["createFile", "extractUrlText", "fetchUrl", "readFile"]
        );
    }

    #[test]
    fn test_resolve_by_kind() {
        let registry = ToolRegistry::with_builtins(&ToolsConfig::default());
        let tool = registry.resolve(ToolKind::ReadFile).unwrap();
        assert_eq!(tool.definition().name, "readFile");
        assert!(matches!(
            registry.resolve(ToolKind::ResolveOutput),
            Err(TesseraError::ToolNotFound(name)) if name == "resolveOutput"
        ));
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        let result = registry
            .execute("nope", serde_json::json!({}), context(dir.path()))
            .await;
        assert!(matches!(result, Err(TesseraError::ToolNotFound(_))));
    }

    #[tokio::test]
    async fn test_execute_create_file_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::with_builtins(&ToolsConfig::default());
        assert!(registry.resolve(ToolKind::CreateFile).unwrap().auto_resolve());
        let result = registry
            .execute(
                "createFile",
                serde_json::json!({"filename": "a.txt", "content": "hi"}),
                context(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(result.files.len(), 1);
    }
}
