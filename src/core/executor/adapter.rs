//! Glue between descriptors, the executor and the function registry.

use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::HttpToolExecutor;
use crate::core::descriptor::HttpToolDescriptor;
use crate::core::realtime::ToolDefinition;
use crate::core::registry::{ToolFn, ToolRegistry, call_cancel_token};

/// Wrap a descriptor as a registry callable.
///
/// The call is aborted when the caller's call token fires.
pub fn tool_function(executor: HttpToolExecutor, descriptor: HttpToolDescriptor) -> ToolFn {
    let descriptor = Arc::new(descriptor);
    Arc::new(move |args: Value| {
        let executor = executor.clone();
        let descriptor = descriptor.clone();
        Box::pin(async move {
            let cancel = call_cancel_token();
            executor.execute_with_cancel(&descriptor, args, cancel).await
        })
    })
}

/// Session-facing definition for a tool registered under `name`.
pub fn tool_definition(descriptor: &HttpToolDescriptor, name: &str) -> ToolDefinition {
    ToolDefinition::function(
        name,
        Some(descriptor.description.clone()).filter(|d| !d.is_empty()),
        Some(descriptor.parameters.clone()),
    )
}

/// Switch the registry to a new tenant's tool set.
///
/// Every function under `prefix` that is not part of `tools` is removed,
/// then each tool is registered as `prefix + name`. Returns the definitions
/// to push with `update_session`, in the order of `tools`.
pub fn install_tenant_tools(
    registry: &ToolRegistry,
    executor: &HttpToolExecutor,
    tools: &[HttpToolDescriptor],
    prefix: &str,
) -> Vec<ToolDefinition> {
    let names: Vec<String> = tools
        .iter()
        .map(|t| format!("{}{}", prefix, t.name))
        .collect();
    let keep: Vec<&str> = names.iter().map(String::as_str).collect();
    let removed = registry.unregister_by_prefix(prefix, &keep);

    let mut definitions = Vec::with_capacity(tools.len());
    for (tool, name) in tools.iter().zip(&names) {
        registry.register(name.clone(), tool_function(executor.clone(), tool.clone()));
        definitions.push(tool_definition(tool, name));
    }

    info!(
        tenant = executor.tenant_id(),
        installed = definitions.len(),
        removed = removed.len(),
        "Installed tenant tools"
    );
    definitions
}
