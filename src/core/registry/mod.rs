//! Function registry for model-callable tools.
//!
//! Each session owns one [`ToolRegistry`]: a name → async callable map that
//! the session consults when the model requests a function call. Mutations
//! are synchronous and notify subscribers with a [`RegistryEvent`].
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use waav_realtime::core::registry::{ToolFn, ToolRegistry};
//!
//! let registry = ToolRegistry::new();
//! let echo: ToolFn = Arc::new(|args| Box::pin(async move { json!({"ok": true, "data": args}) }));
//! registry.register("http_echo", echo);
//!
//! assert!(registry.has_function("http_echo"));
//! assert_eq!(registry.unregister_by_prefix("http_", &[]), vec!["http_echo".to_string()]);
//! assert!(registry.list_names().is_empty());
//! ```

pub mod mirror;

pub use mirror::{MirrorSnapshot, RegistryMirror, global_mirror};

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Async callable invoked with the parsed function-call arguments.
pub type ToolFn = Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Value> + Send>> + Send + Sync>;

tokio::task_local! {
    static CALL_CANCEL: CancellationToken;
}

/// Run `function` with `cancel` as the token of the current call.
///
/// Callables reach it through [`call_cancel_token`].
pub async fn call_with_cancel(function: &ToolFn, args: Value, cancel: CancellationToken) -> Value {
    CALL_CANCEL.scope(cancel, function(args)).await
}

/// Token of the call being run, or a fresh token outside [`call_with_cancel`].
pub fn call_cancel_token() -> CancellationToken {
    CALL_CANCEL.try_with(CancellationToken::clone).unwrap_or_default()
}

/// Listener notified after every registry mutation.
pub type RegistryListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Registry change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered { name: String },
    Unregistered { name: String },
    BulkUnregistered { prefix: String, names: Vec<String> },
}

struct Inner {
    functions: RwLock<HashMap<String, ToolFn>>,
    listeners: RwLock<Vec<(u64, RegistryListener)>>,
    next_listener: AtomicU64,
}

/// Name → callable map with change notifications.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Clone)]
pub struct ToolRegistry {
    inner: Arc<Inner>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                functions: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Insert or overwrite a function.
    pub fn register(&self, name: impl Into<String>, function: ToolFn) {
        let name = name.into();
        let replaced = self
            .inner
            .functions
            .write()
            .insert(name.clone(), function)
            .is_some();
        debug!(function = %name, replaced, "Registered function");
        self.notify(&RegistryEvent::Registered { name });
    }

    /// Remove a function. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        let existed = self.inner.functions.write().remove(name).is_some();
        if existed {
            debug!(function = %name, "Unregistered function");
            self.notify(&RegistryEvent::Unregistered {
                name: name.to_string(),
            });
        }
        existed
    }

    /// Remove every function starting with `prefix` except those in `keep`.
    ///
    /// Returns the removed names, sorted.
    pub fn unregister_by_prefix(&self, prefix: &str, keep: &[&str]) -> Vec<String> {
        let mut removed = {
            let mut functions = self.inner.functions.write();
            let doomed: Vec<String> = functions
                .keys()
                .filter(|name| name.starts_with(prefix) && !keep.contains(&name.as_str()))
                .cloned()
                .collect();
            for name in &doomed {
                functions.remove(name);
            }
            doomed
        };
        removed.sort();

        if !removed.is_empty() {
            info!(prefix = %prefix, count = removed.len(), "Unregistered functions by prefix");
            self.notify(&RegistryEvent::BulkUnregistered {
                prefix: prefix.to_string(),
                names: removed.clone(),
            });
        }
        removed
    }

    /// Shallow copy of the current map.
    pub fn snapshot(&self) -> HashMap<String, ToolFn> {
        self.inner.functions.read().clone()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.inner.functions.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<ToolFn> {
        self.inner.functions.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a listener for registry changes.
    ///
    /// The listener stays active until the returned [`Subscription`] is
    /// dropped or unsubscribed.
    pub fn subscribe(&self, listener: RegistryListener) -> Subscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().push((id, listener));
        Subscription {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Keep the process-wide mirror in sync with this registry.
    pub fn publish_to_mirror(&self) -> Subscription {
        let mirror = global_mirror();
        mirror.publish(self.list_names());

        let weak = Arc::downgrade(&self.inner);
        self.subscribe(Arc::new(move |_event: &RegistryEvent| {
            if let Some(inner) = weak.upgrade() {
                let mut names: Vec<String> = inner.functions.read().keys().cloned().collect();
                names.sort();
                global_mirror().publish(names);
            }
        }))
    }

    fn notify(&self, event: &RegistryEvent) {
        // Listeners run outside the lock so they may call back into the registry.
        let listeners: Vec<RegistryListener> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("functions", &self.list_names())
            .finish()
    }
}

/// Handle for an active registry listener.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    registry: Weak<Inner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.listeners.write().retain(|(id, _)| *id != self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
