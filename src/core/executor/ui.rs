//! UI side effects produced by tool calls.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::descriptor::UiBlock;

/// A UI side effect requested by a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    /// The call has started
    Loading { tool: String, message: String },
    /// The call has finished; `block` is fully resolved
    Result {
        tool: String,
        ok: bool,
        block: UiBlock,
    },
}

/// Renders UI side effects. Rendering itself is out of scope for this crate;
/// hosts plug in their own surface.
pub trait UiHook: Send + Sync {
    fn on_ui_event(&self, event: UiEvent);
}

/// Forwards UI events into an unbounded channel.
pub struct ChannelUiHook {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelUiHook {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UiHook for ChannelUiHook {
    fn on_ui_event(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("UI event receiver dropped");
        }
    }
}
