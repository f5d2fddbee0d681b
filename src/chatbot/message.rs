//! Inbound message types.
//!
//! A webhook (or the console adapter) hands the engine a [`Payload`]; once any
//! audio has been transcribed it becomes an [`InboundEvent`] carrying plain text.

use crate::chatbot::audio::AudioFormat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the user sent the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Voice,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Voice => f.write_str("voice"),
        }
    }
}

/// Raw message content as received from the messaging provider.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    Voice { data: Vec<u8>, format: AudioFormat },
}

impl Payload {
    pub fn modality(&self) -> Modality {
        match self {
            Self::Text(_) => Modality::Text,
            Self::Voice { .. } => Modality::Voice,
        }
    }
}

/// A message ready for intent resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub sender_id: String,
    pub text: String,
    pub modality: Modality,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    pub fn text(sender_id: &str, text: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            text: text.trim().to_string(),
            modality: Modality::Text,
            timestamp,
        }
    }

    pub fn voice(sender_id: &str, transcript: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            modality: Modality::Voice,
            ..Self::text(sender_id, transcript, timestamp)
        }
    }

    /// Short single-line form of the text for logs.
    pub fn preview(&self) -> String {
        preview(&self.text)
    }
}

/// Max chars of user text written to logs.
const MAX_PREVIEW_LENGTH: usize = 80;

pub fn preview(text: &str) -> String {
    let line = text.replace('\n', " ");
    if line.len() <= MAX_PREVIEW_LENGTH {
        line
    } else {
        format!("{}...", truncate_safe(&line, MAX_PREVIEW_LENGTH))
    }
}

/// Safely truncate a string at a char boundary.
fn truncate_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
