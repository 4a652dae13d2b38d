use super::types::{Message, Sender};
use parking_lot::RwLock;
use std::sync::Arc;

/// Session transcript shared between the coordinator and the UI
#[derive(Debug, Clone)]
pub struct Transcript {
    messages: Arc<RwLock<Vec<Message>>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            messages: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Append a message. A real message first removes its sender's typing placeholder.
    pub fn add(&self, message: Message) {
        let mut messages = self.messages.write();
        if !message.is_typing {
            messages.retain(|m| !(m.is_typing && m.sender.id == message.sender.id));
        }
        messages.push(message);
    }

    /// Post a typing placeholder unless the sender already has one
    pub fn add_placeholder(&self, sender: Sender) {
        let mut messages = self.messages.write();
        if messages.iter().any(|m| m.is_typing && m.sender.id == sender.id) {
            return;
        }
        messages.push(Message::typing(sender));
    }

    /// Remove a sender's placeholder; returns whether one was present
    pub fn remove_placeholder(&self, sender_id: &str) -> bool {
        let mut messages = self.messages.write();
        let before = messages.len();
        messages.retain(|m| !(m.is_typing && m.sender.id == sender_id));
        before != messages.len()
    }

    pub fn get_all(&self) -> Vec<Message> {
        self.messages.read().clone()
    }

    pub fn clear(&self) {
        self.messages.write().clear();
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}
