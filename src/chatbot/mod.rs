//! Chatbot module - answers farmers' crop questions over text and voice.

pub mod audio;
pub mod database;
pub mod engine;
pub mod intent;
pub mod knowledge;
pub mod message;
pub mod replies;
pub mod session;
pub mod speech_api;
pub mod sweeper;
#[cfg(feature = "whisper")]
pub mod whisper;

#[cfg(test)]
mod tests;

pub use audio::{AudioFormat, AudioNormalizer, FfmpegConverter, Transcriber, TranscriptionError};
pub use database::Database;
pub use engine::{ConversationEngine, TurnOutcome};
pub use intent::{CropField, IntentResolver, ResolvedIntent};
pub use knowledge::{DataLoadError, Field, KnowledgeStore, NotFound};
pub use message::{InboundEvent, Modality, Payload};
pub use session::{PendingQuery, QueryKind, Session, SessionError, SessionState, SessionStore, Slot};
pub use speech_api::SpeechApiClient;
#[cfg(feature = "whisper")]
pub use whisper::Whisper;
