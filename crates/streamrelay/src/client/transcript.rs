//! Conversation transcript with an explicit streaming pointer
//!
//! Messages are only ever appended. While a reply is streaming, `streaming`
//! points at the assistant entry being grown; folding a new accumulator value
//! rewrites that entry in place instead of inspecting the last element's role.

use crate::messages::Message;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    messages: Vec<Message>,
    streaming: Option<usize>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Index of the assistant entry currently being streamed
    pub fn streaming_index(&self) -> Option<usize> {
        self.streaming
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.streaming = None;
        self.messages.push(Message::user(content));
    }

    /// Start a new generation; the next fold appends a fresh assistant entry
    pub fn begin_reply(&mut self) {
        self.streaming = None;
    }

    /// Fold the running accumulator into the transcript
    pub fn fold(&mut self, accumulated: &str) {
        match self.streaming {
            Some(index) => {
                if let Some(entry) = self.messages.get_mut(index) {
                    entry.content.clear();
                    entry.content.push_str(accumulated);
                }
            }
            None => {
                self.messages.push(Message::assistant(accumulated));
                self.streaming = Some(self.messages.len() - 1);
            }
        }
    }

    /// Close the current generation
    pub fn finish_reply(&mut self) {
        self.streaming = None;
    }

    /// Drop everything past `len`, discarding any partial reply
    pub fn rollback(&mut self, len: usize) {
        self.messages.truncate(len);
        if self.streaming.is_some_and(|index| index >= len) {
            self.streaming = None;
        }
    }
}

impl From<Vec<Message>> for Transcript {
    fn from(messages: Vec<Message>) -> Self {
        Self {
            messages,
            streaming: None,
        }
    }
}
