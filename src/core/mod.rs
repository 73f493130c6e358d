pub mod descriptor;
pub mod executor;
pub mod realtime;
pub mod registry;
pub mod template;

// Re-export commonly used types for convenience
pub use descriptor::{
    DescriptorError, HttpToolDescriptor, Ingested, LintIssue, LintResult, Severity,
    ToolDescriptor, ingest, lint, load_descriptors,
};

pub use executor::{
    DirectEgress, HttpToolExecutor, ProxyEgress, ToolEgress, ToolError, ToolOutcome, UiEvent,
    UiHook, install_tenant_tools,
};

pub use realtime::{
    RealtimeError, RealtimeResult, RealtimeSession, SessionConfig, SessionOptions, SessionStatus,
    ToolDefinition,
};

pub use registry::{Subscription, ToolFn, ToolRegistry, call_cancel_token, call_with_cancel, global_mirror};

pub use template::{SecretResolver, TemplateContext, TemplateScope, apply_template, resolve};
