//! Conversation state reconciled from streaming transcript events.
//!
//! Each role has at most one open (non-final) item at a time. Partial
//! transcripts replace or append to the open item until a completion event
//! finalizes it; finalized items are never edited again.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Audio is still arriving
    Speaking,
    /// Audio committed, transcript pending
    Processing,
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub is_final: bool,
    pub status: ItemStatus,
    pub timestamp: OffsetDateTime,
    /// Server-side item id, when the server announced one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

impl ConversationItem {
    fn new(role: Role, text: String, status: ItemStatus, item_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            text,
            is_final: status == ItemStatus::Final,
            status,
            timestamp: OffsetDateTime::now_utc(),
            item_id,
        }
    }

    fn finalize(&mut self) {
        self.is_final = true;
        self.status = ItemStatus::Final;
    }
}

/// Ordered conversation log with one open-item cursor per streaming role.
#[derive(Debug, Default, Clone)]
pub struct Conversation {
    items: Vec<ConversationItem>,
    open_user: Option<usize>,
    open_assistant: Option<usize>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[ConversationItem] {
        &self.items
    }

    pub fn snapshot(&self) -> Vec<ConversationItem> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn open_user(&self) -> Option<&ConversationItem> {
        self.open_user.map(|i| &self.items[i])
    }

    pub fn open_assistant(&self) -> Option<&ConversationItem> {
        self.open_assistant.map(|i| &self.items[i])
    }

    fn cursor(&mut self, role: Role) -> &mut Option<usize> {
        match role {
            Role::Assistant => &mut self.open_assistant,
            _ => &mut self.open_user,
        }
    }

    /// Index of the open item for `role`, creating one if needed.
    fn open(&mut self, role: Role, status: ItemStatus, item_id: Option<String>) -> usize {
        if let Some(idx) = *self.cursor(role) {
            let item = &mut self.items[idx];
            if item.item_id.is_none() {
                item.item_id = item_id;
            }
            return idx;
        }
        self.items
            .push(ConversationItem::new(role, String::new(), status, item_id));
        let idx = self.items.len() - 1;
        *self.cursor(role) = Some(idx);
        idx
    }

    /// User started speaking. Reuses the open user item if one exists.
    pub fn speech_started(&mut self, item_id: Option<String>) {
        let idx = self.open(Role::User, ItemStatus::Speaking, item_id);
        self.items[idx].status = ItemStatus::Speaking;
    }

    /// User audio committed; the open item waits for its transcript.
    pub fn committed(&mut self, item_id: Option<String>) {
        let idx = self.open(Role::User, ItemStatus::Processing, item_id);
        self.items[idx].status = ItemStatus::Processing;
    }

    /// Partial transcript. Replaces the open item's text and flips its
    /// status between speaking and processing.
    pub fn user_partial(&mut self, item_id: Option<String>, text: &str) {
        let idx = self.open(Role::User, ItemStatus::Processing, item_id);
        let item = &mut self.items[idx];
        item.text = text.to_string();
        item.status = match item.status {
            ItemStatus::Speaking => ItemStatus::Processing,
            _ => ItemStatus::Speaking,
        };
    }

    /// Final transcript. Finalizes the open item (or appends a final one).
    pub fn user_completed(&mut self, item_id: Option<String>, text: &str) {
        let idx = self.open(Role::User, ItemStatus::Processing, item_id);
        let item = &mut self.items[idx];
        item.text = text.trim().to_string();
        item.finalize();
        self.open_user = None;
    }

    /// Transcription failed; the open user item is dropped.
    pub fn user_failed(&mut self) {
        if let Some(idx) = self.open_user.take() {
            self.remove_at(idx);
        }
    }

    pub fn assistant_delta(&mut self, item_id: Option<String>, delta: &str) {
        let idx = self.open(Role::Assistant, ItemStatus::Speaking, item_id);
        self.items[idx].text.push_str(delta);
    }

    /// Finalize the open assistant item, replacing its text with the
    /// authoritative transcript when one is given.
    pub fn assistant_done(&mut self, item_id: Option<String>, text: Option<&str>) {
        let Some(idx) = self.open_assistant.take() else {
            if let Some(text) = text.filter(|t| !t.is_empty()) {
                self.add_final(Role::Assistant, text, item_id);
            }
            return;
        };
        let item = &mut self.items[idx];
        if let Some(text) = text {
            item.text = text.to_string();
        }
        item.finalize();
    }

    /// Append an already-final item.
    pub fn add_final(&mut self, role: Role, text: &str, item_id: Option<String>) {
        self.items.push(ConversationItem::new(
            role,
            text.to_string(),
            ItemStatus::Final,
            item_id,
        ));
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.open_user = None;
        self.open_assistant = None;
    }

    fn remove_at(&mut self, idx: usize) {
        self.items.remove(idx);
        for cursor in [&mut self.open_user, &mut self.open_assistant] {
            if let Some(i) = cursor
                && *i > idx
            {
                *i -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn non_final(conv: &Conversation, role: Role) -> usize {
        conv.items()
            .iter()
            .filter(|i| i.role == role && !i.is_final)
            .count()
    }

    #[test]
    fn test_user_partials_then_completed() {
        let mut conv = Conversation::new();
        conv.speech_started(Some("item_1".into()));
        conv.user_partial(Some("item_1".into()), "He");
        conv.user_partial(Some("item_1".into()), "Hello");
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.open_user().unwrap().text, "Hello");

        conv.user_completed(Some("item_1".into()), "Hello world");
        assert_eq!(conv.len(), 1);
        let item = &conv.items()[0];
        assert!(item.is_final);
        assert_eq!(item.status, ItemStatus::Final);
        assert_eq!(item.text, "Hello world");
        assert!(conv.open_user().is_none());
    }

    #[test]
    fn test_partials_toggle_status() {
        let mut conv = Conversation::new();
        conv.speech_started(Some("u1".into()));
        assert_eq!(conv.open_user().unwrap().status, ItemStatus::Speaking);

        conv.user_partial(Some("u1".into()), "He");
        let first = conv.open_user().unwrap().status;
        assert_eq!(first, ItemStatus::Processing);

        conv.user_partial(Some("u1".into()), "Hello");
        let second = conv.open_user().unwrap().status;
        assert_eq!(second, ItemStatus::Speaking);
        assert_eq!(conv.open_user().unwrap().text, "Hello");

        conv.committed(Some("u1".into()));
        conv.user_partial(Some("u1".into()), "Hello w");
        assert_eq!(conv.open_user().unwrap().status, ItemStatus::Speaking);
        conv.user_partial(Some("u1".into()), "Hello wo");
        assert_eq!(conv.open_user().unwrap().status, ItemStatus::Processing);
        assert_eq!(non_final(&conv, Role::User), 1);
    }

    #[test]
    fn test_partial_without_speech_start_opens_item() {
        let mut conv = Conversation::new();
        conv.user_partial(None, "Hi");
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.open_user().unwrap().status, ItemStatus::Speaking);
    }

    #[test]
    fn test_speech_started_reuses_open_item() {
        let mut conv = Conversation::new();
        conv.speech_started(None);
        conv.speech_started(None);
        assert_eq!(conv.len(), 1);
        conv.committed(None);
        assert_eq!(conv.open_user().unwrap().status, ItemStatus::Processing);
        assert_eq!(non_final(&conv, Role::User), 1);
    }

    #[test]
    fn test_assistant_deltas_and_done() {
        let mut conv = Conversation::new();
        conv.assistant_delta(None, "Hi");
        conv.assistant_delta(None, " there");
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.items()[0].text, "Hi there");
        assert!(!conv.items()[0].is_final);

        conv.assistant_done(None, Some("Hi there!"));
        assert_eq!(conv.len(), 1);
        assert!(conv.items()[0].is_final);
        assert_eq!(conv.items()[0].text, "Hi there!");
    }

    #[test]
    fn test_finalized_items_are_not_edited() {
        let mut conv = Conversation::new();
        conv.assistant_delta(None, "one");
        conv.assistant_done(None, None);
        conv.assistant_delta(None, "two");
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.items()[0].text, "one");
        assert_eq!(conv.items()[1].text, "two");
    }

    #[test]
    fn test_interleaved_roles_keep_one_slot_each() {
        let mut conv = Conversation::new();
        conv.speech_started(None);
        conv.assistant_delta(None, "Sure");
        conv.user_partial(None, "wait");
        assert_eq!(non_final(&conv, Role::User), 1);
        assert_eq!(non_final(&conv, Role::Assistant), 1);

        conv.user_failed();
        assert_eq!(conv.len(), 1);
        conv.assistant_delta(None, ", one sec");
        assert_eq!(conv.open_assistant().unwrap().text, "Sure, one sec");
    }

    #[test]
    fn test_clear_resets_cursors() {
        let mut conv = Conversation::new();
        conv.speech_started(None);
        conv.add_final(Role::Tool, "{\"ok\":true}", None);
        conv.clear();
        assert!(conv.is_empty());
        assert!(conv.open_user().is_none());
        conv.assistant_delta(None, "x");
        assert_eq!(conv.len(), 1);
    }
}
