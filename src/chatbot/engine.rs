//! Conversation engine - the per-sender state machine.
//!
//! ```text
//! Idle ──query──▶ Complete ──▶ Idle
//!   │
//!   └─partial──▶ AwaitingCrop / AwaitingRegion ──complete──▶ Complete ──▶ Idle
//! ```
//!
//! Every turn is a read-modify-write of one session under its lease.
//! Transcription happens before the lease is taken.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::chatbot::audio::AudioNormalizer;
use crate::chatbot::intent::{CropField, IntentResolver, ResolvedIntent};
use crate::chatbot::knowledge::{Field, KnowledgeStore, NotFound};
use crate::chatbot::message::{InboundEvent, Payload};
use crate::chatbot::replies;
use crate::chatbot::session::{PendingQuery, Session, SessionError, SessionState, SessionStore, Slot};
use crate::chatbot::sweeper::Sweeper;

/// Result of applying one event to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub reply: String,
    pub from: SessionState,
    /// `Complete` when the turn answered a query; the session is saved as `Idle`.
    pub to: SessionState,
}

/// The conversation engine.
pub struct ConversationEngine {
    knowledge: Arc<KnowledgeStore>,
    resolver: IntentResolver,
    sessions: Arc<SessionStore>,
    audio: Option<Arc<AudioNormalizer>>,
    sweeper: Option<Sweeper>,
}

impl ConversationEngine {
    pub fn new(
        knowledge: Arc<KnowledgeStore>,
        sessions: Arc<SessionStore>,
        audio: Option<Arc<AudioNormalizer>>,
    ) -> Self {
        Self {
            resolver: IntentResolver::new(knowledge.clone()),
            knowledge,
            sessions,
            audio,
            sweeper: None,
        }
    }

    /// Start expiring idle sessions in the background. Stops when the engine
    /// is dropped.
    pub fn start_sweeper(&mut self, interval: Duration) {
        let sessions = self.sessions.clone();
        self.sweeper = Some(Sweeper::new(interval, move || {
            if let Err(e) = sessions.expire_stale(Utc::now()) {
                warn!("Session sweep failed: {}", e);
            }
        }));
        info!("Session sweeper running every {:?}", interval);
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Handle one inbound message and produce the reply text.
    ///
    /// Never fails: every recoverable error becomes a reply.
    pub async fn handle_message(&self, sender_id: &str, payload: Payload) -> String {
        let event = match payload {
            Payload::Text(text) => InboundEvent::text(sender_id, &text, Utc::now()),
            Payload::Voice { data, format } => {
                let Some(audio) = &self.audio else {
                    warn!("Voice message from {} but no transcription backend configured", sender_id);
                    self.touch(sender_id).await;
                    return replies::audio_failed();
                };
                match audio.transcribe(&data, &format).await {
                    Ok(text) => InboundEvent::voice(sender_id, &text, Utc::now()),
                    Err(e) => {
                        warn!("Transcription failed for {}: {}", sender_id, e);
                        self.touch(sender_id).await;
                        return replies::audio_failed();
                    }
                }
            }
        };

        info!("📨 {} ({}): \"{}\"", event.sender_id, event.modality, event.preview());

        match self.turn(&event).await {
            Ok(outcome) => outcome.reply,
            Err(SessionError::Busy { .. }) => replies::busy(),
            Err(e) => {
                error!("Turn failed for {}: {}", sender_id, e);
                replies::storage_failed()
            }
        }
    }

    /// Apply one event to its sender's session.
    pub async fn turn(&self, event: &InboundEvent) -> Result<TurnOutcome, SessionError> {
        let lease = self.sessions.acquire(&event.sender_id).await?;
        let mut session = lease.get_or_create(event.timestamp)?;
        let from = session.state;

        let intent = self.resolver.resolve(&event.text, &session);
        debug!("{}: {:?} in {}", event.sender_id, intent, from);

        let (reply, to) = self.apply(&mut session, intent);
        session.turns += 1;
        session.last_activity = event.timestamp;
        lease.save(&session)?;

        info!("{}: {} -> {}", event.sender_id, from, to);
        Ok(TurnOutcome { reply, from, to })
    }

    /// Record activity without changing conversation state.
    async fn touch(&self, sender_id: &str) {
        let result = async {
            let lease = self.sessions.acquire(sender_id).await?;
            let now = Utc::now();
            let mut session = lease.get_or_create(now)?;
            session.last_activity = now;
            lease.save(&session)
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to record activity for {}: {}", sender_id, e);
        }
    }

    fn apply(&self, session: &mut Session, intent: ResolvedIntent) -> (String, SessionState) {
        match intent {
            ResolvedIntent::Greeting => (replies::welcome(), session.state),
            ResolvedIntent::Reset => {
                session.reset();
                (replies::reset_done(), SessionState::Idle)
            }
            ResolvedIntent::Unrecognized => {
                let reply = replies::unrecognized(session.pending_query.as_ref());
                session.state = SessionState::Idle;
                (reply, SessionState::Idle)
            }
            ResolvedIntent::Clarification { missing, partial } => self.clarify(session, missing, partial),
            ResolvedIntent::CropLookup { crop, field } => {
                let field = match field {
                    CropField::Varieties => Field::Varieties,
                    CropField::Regions => Field::Regions,
                };
                self.answer(session, &crop, &field)
            }
            ResolvedIntent::SowingLookup { crop, region } => {
                self.answer(session, &crop, &Field::SowingTime { region })
            }
        }
    }

    fn clarify(&self, session: &mut Session, missing: Slot, mut partial: PendingQuery) -> (String, SessionState) {
        let record = match partial.crop.as_deref() {
            Some(name) => match self.knowledge.resolve_crop(name) {
                Ok(record) => Some(record),
                Err(e) => return self.not_found(session, &e),
            },
            None => None,
        };

        if let Some(record) = record {
            if missing == Slot::Region && record.sowing.is_empty() {
                let e = NotFound::NoData { crop: record.name.clone(), field: "sowing regions" };
                return self.not_found(session, &e);
            }
            partial.crop = Some(record.name.clone());
        }

        let reply = replies::ask_for(missing, &partial, record);
        let next = missing.awaiting_state();
        session.pending_query = Some(partial);
        session.state = next;
        (reply, next)
    }

    fn answer(&self, session: &mut Session, crop: &str, field: &Field) -> (String, SessionState) {
        match self.knowledge.lookup(crop, field) {
            Ok(answer) => {
                session.reset();
                (replies::answer(&answer), SessionState::Complete)
            }
            Err(e) => self.not_found(session, &e),
        }
    }

    fn not_found(&self, session: &mut Session, err: &NotFound) -> (String, SessionState) {
        info!("{}: {}", session.sender_id, err);
        session.reset();
        (replies::not_found(err), SessionState::Idle)
    }
}
