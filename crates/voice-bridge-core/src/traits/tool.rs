//! Tool executor seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Description of a tool the host can run, in the shape the realtime
/// endpoint expects to have advertised (`name`, `description`, JSON-Schema
/// `parameters`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Execution context handed to the host with every tool call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallContext {
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<String>,
}

/// Host-provided tool registry and executor.
///
/// Only tools that appear in `list_tools` may be advertised upstream;
/// a tool without an executor must never be offered to the model.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tools the host can actually run.
    fn list_tools(&self) -> Vec<ToolSpec>;

    /// Execute a named tool with JSON arguments.
    async fn execute(&self, name: &str, args: Value, ctx: &ToolCallContext) -> Result<Value>;
}

/// Executor with no tools; used when the host wires none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullToolExecutor;

#[async_trait]
impl ToolExecutor for NullToolExecutor {
    fn list_tools(&self) -> Vec<ToolSpec> {
        Vec::new()
    }

    async fn execute(&self, name: &str, _args: Value, _ctx: &ToolCallContext) -> Result<Value> {
        Err(crate::error::BridgeError::Internal(format!(
            "no executor for tool {}",
            name
        )))
    }
}
