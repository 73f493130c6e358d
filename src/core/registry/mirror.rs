//! Process-wide, read-only view of registered function names.
//!
//! Used for introspection (debug endpoints, CLI status). Sessions never
//! consult it to dispatch calls; the owning [`ToolRegistry`] is always the
//! source of truth.
//!
//! [`ToolRegistry`]: super::ToolRegistry

use arc_swap::ArcSwap;
use std::sync::{Arc, OnceLock};
use time::OffsetDateTime;

/// Names as of the last publish.
#[derive(Debug, Clone)]
pub struct MirrorSnapshot {
    pub names: Vec<String>,
    pub updated_at: OffsetDateTime,
    /// Number of publishes so far
    pub generation: u64,
}

pub struct RegistryMirror {
    current: ArcSwap<MirrorSnapshot>,
}

impl RegistryMirror {
    fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(MirrorSnapshot {
                names: Vec::new(),
                updated_at: OffsetDateTime::now_utc(),
                generation: 0,
            }),
        }
    }

    /// Lock-free read of the latest snapshot.
    pub fn load(&self) -> Arc<MirrorSnapshot> {
        self.current.load_full()
    }

    pub fn names(&self) -> Vec<String> {
        self.current.load().names.clone()
    }

    pub(crate) fn publish(&self, names: Vec<String>) {
        self.current.rcu(|prev| MirrorSnapshot {
            names: names.clone(),
            updated_at: OffsetDateTime::now_utc(),
            generation: prev.generation + 1,
        });
        tracing::trace!(count = names.len(), "Published registry mirror");
    }
}

static GLOBAL_MIRROR: OnceLock<RegistryMirror> = OnceLock::new();

/// Get the process-wide registry mirror.
pub fn global_mirror() -> &'static RegistryMirror {
    GLOBAL_MIRROR.get_or_init(RegistryMirror::new)
}
