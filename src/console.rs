//! Line-oriented stand-in for the messaging webhook.
//!
//! Each stdin line is one inbound message:
//!
//! ```text
//! 919800000001: sowing time for wheat
//! 919800000001: /voice note.ogg
//! 919800000002: /voice note.bin audio/ogg; codecs=opus
//! varieties of wheat            (uses the default sender)
//! ```

use crate::chatbot::{AudioFormat, Payload};
use std::fmt;
use std::path::PathBuf;

pub const VOICE_COMMAND: &str = "/voice";

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleInput {
    Text(String),
    VoiceFile { path: PathBuf, format: AudioFormat },
}

#[derive(Debug, PartialEq, Eq)]
pub struct ConsoleCommand {
    pub sender_id: String,
    pub input: ConsoleInput,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    MissingVoicePath,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingVoicePath => write!(f, "usage: <sender>: {} <file> [mime-type]", VOICE_COMMAND),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str, default_sender: &str) -> Result<Option<ConsoleCommand>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    // "sender: text", as long as the sender part is a single token.
    let (sender_id, body) = match line.split_once(':') {
        Some((sender, body)) if !sender.is_empty() && !sender.contains(char::is_whitespace) => {
            (sender.to_string(), body.trim())
        }
        _ => (default_sender.to_string(), line),
    };
    if body.is_empty() {
        return Ok(None);
    }

    let input = match body.strip_prefix(VOICE_COMMAND) {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
            let rest = rest.trim();
            let (path, mime) = match rest.split_once(char::is_whitespace) {
                Some((path, mime)) => (path, Some(mime.trim())),
                None => (rest, None),
            };
            if path.is_empty() {
                return Err(ParseError::MissingVoicePath);
            }
            let path = PathBuf::from(path);
            let format = match mime {
                Some(mime) => AudioFormat::from_mime(mime),
                None => AudioFormat::from_path(&path),
            };
            ConsoleInput::VoiceFile { path, format }
        }
        _ => ConsoleInput::Text(body.to_string()),
    };

    Ok(Some(ConsoleCommand { sender_id, input }))
}

impl ConsoleCommand {
    /// Build the engine payload, reading any voice file.
    pub async fn into_payload(self) -> std::io::Result<(String, Payload)> {
        let payload = match self.input {
            ConsoleInput::Text(text) => Payload::Text(text),
            ConsoleInput::VoiceFile { path, format } => Payload::Voice { data: tokio::fs::read(&path).await?, format },
        };
        Ok((self.sender_id, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(sender: &str, body: &str) -> Option<ConsoleCommand> {
        Some(ConsoleCommand { sender_id: sender.into(), input: ConsoleInput::Text(body.into()) })
    }

    #[test]
    fn test_sender_and_text() {
        assert_eq!(parse_line("919800000001: wheat varieties", "me"), Ok(text("919800000001", "wheat varieties")));
    }

    #[test]
    fn test_default_sender() {
        assert_eq!(parse_line("wheat varieties", "me"), Ok(text("me", "wheat varieties")));
        // A colon inside the question is not a sender.
        assert_eq!(parse_line("sowing time: wheat", "me"), Ok(text("me", "sowing time: wheat")));
    }

    #[test]
    fn test_blank_lines() {
        assert_eq!(parse_line("   ", "me"), Ok(None));
        assert_eq!(parse_line("919800000001:", "me"), Ok(None));
    }

    #[test]
    fn test_voice_command() {
        let cmd = parse_line("a: /voice /tmp/note.ogg", "me").unwrap().unwrap();
        assert_eq!(
            cmd.input,
            ConsoleInput::VoiceFile { path: "/tmp/note.ogg".into(), format: AudioFormat::OggOpus }
        );

        let cmd = parse_line("a: /voice note.bin audio/mpeg", "me").unwrap().unwrap();
        assert_eq!(cmd.input, ConsoleInput::VoiceFile { path: "note.bin".into(), format: AudioFormat::Mpeg });

        assert_eq!(parse_line("a: /voice", "me"), Err(ParseError::MissingVoicePath));
        // Only the exact command word.
        assert_eq!(parse_line("a: /voicemail", "me"), Ok(text("a", "/voicemail")));
    }

    #[tokio::test]
    async fn test_into_payload_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.ogg");
        std::fs::write(&path, b"OggS").unwrap();

        let cmd = ConsoleCommand {
            sender_id: "a".into(),
            input: ConsoleInput::VoiceFile { path: path.clone(), format: AudioFormat::OggOpus },
        };
        let (sender, payload) = cmd.into_payload().await.unwrap();
        assert_eq!(sender, "a");
        assert!(matches!(payload, Payload::Voice { ref data, .. } if data == b"OggS"));

        let missing = ConsoleCommand {
            sender_id: "a".into(),
            input: ConsoleInput::VoiceFile { path: dir.path().join("nope.ogg"), format: AudioFormat::OggOpus },
        };
        assert!(missing.into_payload().await.is_err());
    }
}
