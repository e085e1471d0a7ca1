//! Tool registry: catalogue, schema validation, confirmation policy

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use sigil_ai::ToolDef;
use tokio_util::sync::CancellationToken;

use crate::tool::{BoxedTool, OutputSink, ToolResult, to_tool_def};

/// Read-only tools whose concurrent execution cannot interfere
const PARALLEL_SAFE: &[&str] = &[
    "web_search",
    "web_fetch",
    "web_crawl",
    "file_read",
    "file_search",
];

/// Named tool catalogue with schema validation and confirmation gating.
///
/// Read-mostly: lookups take a read lock, the compiled-schema cache is
/// keyed by the canonical JSON text of each schema.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, BoxedTool>>,
    auto_approved: RwLock<HashSet<String>>,
    allow_all: AtomicBool,
    schema_cache: RwLock<HashMap<String, Arc<jsonschema::Validator>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool of the same name
    pub fn register(&self, tool: BoxedTool) {
        self.tools.write().insert(tool.name().to_string(), tool);
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<BoxedTool> {
        self.tools.read().get(name).cloned()
    }

    /// Wire-level definitions for every registered tool
    pub fn tool_defs(&self) -> Vec<ToolDef> {
        let tools = self.tools.read();
        let mut defs: Vec<ToolDef> = tools.values().map(|t| to_tool_def(t.as_ref())).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Registered tool names
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Add a tool to the auto-approve set
    pub fn auto_approve(&self, name: impl Into<String>) {
        self.auto_approved.write().insert(name.into());
    }

    /// Skip confirmation for every tool
    pub fn set_allow_all(&self, allow: bool) {
        self.allow_all.store(allow, Ordering::Release);
    }

    /// Whether executing `name` requires human confirmation
    pub fn needs_confirmation(&self, name: &str) -> bool {
        if self.allow_all.load(Ordering::Acquire) {
            return false;
        }
        if self.auto_approved.read().contains(name) {
            return false;
        }
        match self.get(name) {
            Some(tool) => tool.needs_confirmation(),
            None => false,
        }
    }

    /// Whether `name` may run concurrently with other parallel-safe tools
    pub fn is_parallel_safe(&self, name: &str) -> bool {
        PARALLEL_SAFE.contains(&name)
    }

    /// Execute a tool by name.
    ///
    /// Unknown tools, malformed argument JSON, and schema violations are
    /// soft errors reported in `ToolResult::error`; hard failures come back
    /// as `Err` from the executor itself.
    pub async fn execute(
        &self,
        name: &str,
        arguments: &str,
        cancel: CancellationToken,
        output: Option<OutputSink>,
    ) -> crate::error::Result<ToolResult> {
        let Some(tool) = self.get(name) else {
            return Ok(ToolResult::soft_error(format!("unknown tool: {}", name)));
        };

        let parsed: serde_json::Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(e) => {
                return Ok(ToolResult::soft_error(format!(
                    "invalid JSON in tool arguments: {}",
                    e
                )));
            }
        };

        if let Some(violations) = self.validate(tool.as_ref(), &parsed) {
            return Ok(ToolResult::soft_error(violations));
        }

        match output {
            Some(sink) if tool.supports_streaming() => {
                tool.execute_stream(arguments, cancel, sink).await
            }
            _ => tool.execute(arguments, cancel).await,
        }
    }

    /// Validate arguments against the tool's schema.
    ///
    /// Returns `Some(message)` listing up to 3 violations, `None` if valid
    /// (or if the schema itself does not compile, which is logged and
    /// skipped).
    fn validate(&self, tool: &dyn crate::tool::Tool, args: &serde_json::Value) -> Option<String> {
        let schema = tool.parameters();
        let validator = self.validator_for(tool.name(), &schema)?;

        let violations: Vec<String> = validator
            .iter_errors(args)
            .take(3)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();

        if violations.is_empty() {
            None
        } else {
            Some(format!(
                "tool argument validation failed:\n{}",
                violations.join("\n")
            ))
        }
    }

    /// Get or compile the cached validator for a schema
    fn validator_for(
        &self,
        tool_name: &str,
        schema: &serde_json::Value,
    ) -> Option<Arc<jsonschema::Validator>> {
        let key = schema.to_string();
        if let Some(v) = self.schema_cache.read().get(&key) {
            return Some(v.clone());
        }
        match jsonschema::validator_for(schema) {
            Ok(v) => {
                let v = Arc::new(v);
                self.schema_cache.write().insert(key, v.clone());
                Some(v)
            }
            Err(e) => {
                tracing::warn!(
                    "Invalid parameter schema for tool '{}', skipping validation: {}",
                    tool_name,
                    e
                );
                None
            }
        }
    }
}
