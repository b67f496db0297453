//! Query filter predicates applied to buffered and live messages.
//!
//! A query carries zero or more filters; a message is delivered only when
//! every filter matches (conjunction).

use std::sync::Arc;

use crate::message::Message;

/// A predicate over a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Matches messages whose PROCID field equals the given value.
    ProcId(String),
    /// Matches messages whose raw encoding contains the given byte sequence.
    Contains(String),
}

impl Filter {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Filter::ProcId(want) => message.proc_id() == Some(want.as_str()),
            Filter::Contains(needle) => contains(message.as_bytes(), needle.as_bytes()),
        }
    }
}

/// True when every filter matches. An empty filter list matches everything.
pub fn all_match(message: &Message, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| filter.matches(message))
}

/// Keeps the messages matching every filter, preserving order.
pub fn apply(messages: Vec<Arc<Message>>, filters: &[Filter]) -> Vec<Arc<Message>> {
    if filters.is_empty() {
        return messages;
    }
    messages
        .into_iter()
        .filter(|message| all_match(message, filters))
        .collect()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}
