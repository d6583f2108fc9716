//! Chat Subchannel
//!
//! Local view of a room's chat: the persisted history loaded on join plus
//! live messages carried on the signaling channel. Works regardless of the
//! negotiation state.
//!
//! Sending is optimistic. The line is appended as pending and confirmed when
//! the relay echoes it back; the relay's timestamp replaces the local one.

use crate::signaling::SignalingMessage;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use teleconsult_core::timestamp::parse_timestamp;
use teleconsult_core::ChatMessage;
use tracing::debug;

/// One line of the local chat log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    /// Message
    pub message: ChatMessage,
    /// Sent locally, echo not yet seen
    pub pending: bool,
}

/// What an inbound chat frame did to the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatReceipt {
    /// Echo of our own pending line
    Delivered(ChatMessage),
    /// New line
    Received(ChatMessage),
}

/// Chat log for one session
#[derive(Debug, Clone)]
pub struct ChatSubchannel {
    local_user: String,
    entries: Vec<ChatEntry>,
}

impl ChatSubchannel {
    /// Empty log for `local_user`
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            entries: Vec::new(),
        }
    }

    /// Replace the confirmed part of the log with persisted history
    pub fn load_history(&mut self, mut history: Vec<ChatMessage>) {
        history.sort_by_key(|m| m.timestamp);
        let pending: Vec<ChatEntry> = self.entries.drain(..).filter(|e| e.pending).collect();

        self.entries = history
            .into_iter()
            .map(|message| ChatEntry {
                message,
                pending: false,
            })
            .chain(pending)
            .collect();
        debug!("Loaded {} chat history entries", self.entries.len());
    }

    /// Record an outgoing line and build the frame to send
    pub fn compose(&mut self, text: &str) -> Result<SignalingMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidState("chat message is empty".to_string()));
        }

        self.entries.push(ChatEntry {
            message: ChatMessage::new(self.local_user.clone(), text),
            pending: true,
        });
        Ok(SignalingMessage::chat(text))
    }

    /// Drop the most recent line if it is still pending
    ///
    /// Used when the frame built by [`compose`](Self::compose) could not be
    /// queued.
    pub fn withdraw_last(&mut self) -> Option<ChatEntry> {
        match self.entries.last() {
            Some(entry) if entry.pending => self.entries.pop(),
            _ => None,
        }
    }

    /// Apply an inbound frame
    ///
    /// `None` for anything that is not chat, and for a relayed line already
    /// present in the loaded history (same sender, text and relay time).
    pub fn receive(&mut self, frame: &SignalingMessage) -> Option<ChatReceipt> {
        let SignalingMessage::Chat {
            message,
            from,
            timestamp,
            from_email,
        } = frame
        else {
            return None;
        };

        let sender = from.clone().unwrap_or_else(|| "unknown".to_string());
        let at = timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        if timestamp.is_some() && self.already_logged(&sender, message, at) {
            debug!("Skipping relayed chat line from {} already in history", sender);
            return None;
        }

        if sender == self.local_user {
            if let Some(entry) = self
                .entries
                .iter_mut()
                .find(|e| e.pending && e.message.text == *message)
            {
                entry.pending = false;
                entry.message.timestamp = at;
                if from_email.is_some() {
                    entry.message.sender_email = from_email.clone();
                }
                return Some(ChatReceipt::Delivered(entry.message.clone()));
            }
        }

        let mut line = ChatMessage::new(sender, message.clone()).at(at);
        line.sender_email = from_email.clone();
        self.entries.push(ChatEntry {
            message: line.clone(),
            pending: false,
        });
        Some(ChatReceipt::Received(line))
    }

    // Relay timestamps carry microseconds; history may carry more
    fn already_logged(&self, sender: &str, text: &str, at: DateTime<Utc>) -> bool {
        self.entries.iter().any(|e| {
            !e.pending
                && e.message.sender_id == sender
                && e.message.text == text
                && e.message.timestamp.timestamp_micros() == at.timestamp_micros()
        })
    }

    /// All lines, in log order
    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    /// Messages only, in log order
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    /// Lines still waiting for their echo
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.pending).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn relayed(from: &str, text: &str, ts: &str) -> SignalingMessage {
        SignalingMessage::Chat {
            message: text.to_string(),
            from: Some(from.to_string()),
            timestamp: Some(ts.to_string()),
            from_email: None,
        }
    }

    #[test]
    fn test_history_sorted_by_time() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let mut chat = ChatSubchannel::new("doc-1");
        chat.load_history(vec![
            ChatMessage::new("pat-1", "second").at(base + Duration::minutes(1)),
            ChatMessage::new("doc-1", "first").at(base),
        ]);

        let texts: Vec<_> = chat.messages().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn test_own_echo_confirms_pending_line() {
        let mut chat = ChatSubchannel::new("doc-1");
        let frame = chat.compose("  hello ").unwrap();
        assert_eq!(frame, SignalingMessage::chat("hello"));
        assert_eq!(chat.pending_count(), 1);

        let receipt = chat
            .receive(&relayed("doc-1", "hello", "2024-05-01T10:00:00.000001"))
            .unwrap();

        assert!(matches!(receipt, ChatReceipt::Delivered(_)));
        assert_eq!(chat.entries().len(), 1);
        assert_eq!(chat.pending_count(), 0);
        assert_eq!(
            chat.messages()[0].timestamp,
            parse_timestamp("2024-05-01T10:00:00.000001").unwrap()
        );
    }

    #[test]
    fn test_remote_line_appended() {
        let mut chat = ChatSubchannel::new("doc-1");
        let receipt = chat
            .receive(&relayed("pat-1", "hi doctor", "2024-05-01T10:00:00"))
            .unwrap();

        match receipt {
            ChatReceipt::Received(message) => assert_eq!(message.sender_id, "pat-1"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(chat.entries().len(), 1);
    }

    #[test]
    fn test_empty_message_rejected() {
        let mut chat = ChatSubchannel::new("doc-1");
        assert!(chat.compose("   ").is_err());
        assert!(chat.entries().is_empty());
    }

    #[test]
    fn test_non_chat_frames_ignored() {
        let mut chat = ChatSubchannel::new("doc-1");
        assert!(chat.receive(&SignalingMessage::offer("v=0")).is_none());
    }

    #[test]
    fn test_pending_lines_survive_history_load() {
        let mut chat = ChatSubchannel::new("doc-1");
        chat.compose("typed early").unwrap();
        chat.load_history(vec![ChatMessage::new("pat-1", "old")]);

        assert_eq!(chat.entries().len(), 2);
        assert_eq!(chat.pending_count(), 1);
    }

    #[test]
    fn test_withdraw_only_removes_pending_tail() {
        let mut chat = ChatSubchannel::new("doc-1");
        chat.receive(&relayed("pat-1", "hello", "2024-05-01T10:00:00"));
        assert!(chat.withdraw_last().is_none());

        chat.compose("lost line").unwrap();
        let withdrawn = chat.withdraw_last().unwrap();
        assert_eq!(withdrawn.message.text, "lost line");
        assert_eq!(chat.entries().len(), 1);
        assert_eq!(chat.pending_count(), 0);
    }

    #[test]
    fn test_relayed_line_already_in_history_skipped() {
        let at = parse_timestamp("2024-05-01T10:00:00.123456").unwrap();
        let mut chat = ChatSubchannel::new("doc-1");
        chat.load_history(vec![ChatMessage::new("pat-1", "I'm here").at(at)]);

        let replay = relayed("pat-1", "I'm here", "2024-05-01T10:00:00.123456");
        assert!(chat.receive(&replay).is_none());
        assert_eq!(chat.entries().len(), 1);

        // Same text sent again later is a new line
        let again = relayed("pat-1", "I'm here", "2024-05-01T10:05:00");
        assert!(matches!(chat.receive(&again), Some(ChatReceipt::Received(_))));
        assert_eq!(chat.entries().len(), 2);
    }
}
