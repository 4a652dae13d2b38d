use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who a transcript entry belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub name: String,
}

impl Sender {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: Sender,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Transient "is composing" entry, replaced by the sender's next real message
    pub is_typing: bool,
}

impl Message {
    pub fn new(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            content: content.into(),
            timestamp: Utc::now(),
            is_typing: false,
        }
    }

    pub fn typing(sender: Sender) -> Self {
        Self {
            is_typing: true,
            ..Self::new(sender, String::new())
        }
    }
}
