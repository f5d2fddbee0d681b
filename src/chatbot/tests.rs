//! Conversation-level tests for the chatbot module.
//! Each test drives the engine end to end against an in-memory session store.
//!
//! Run with: cargo test chatbot

use super::*;
use crate::chatbot::audio::tests::normalizer;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

const CATALOGUE: &str = r#"{
    "wheat": {
        "varieties": ["HD-2967", "PBW-343"],
        "sowing": {"north": "Nov-Dec", "Central India": "Oct-Nov"},
        "synonyms": [{"en": "gehu", "hi": "गेहूं"}]
    },
    "Pearl Millet": {"aliases": ["bajra"], "varieties": ["HHB-67"], "sowing": {"Rajasthan": "Jun-Jul"}},
    "Barley": {"varieties": ["RD-2552"]}
}"#;

const TABLE: &str = r#"{"records": []}"#;

const SENDER: &str = "919800000001";

fn engine_with(lock_wait: Duration, audio: Option<AudioNormalizer>) -> ConversationEngine {
    let knowledge = Arc::new(KnowledgeStore::from_json(CATALOGUE, TABLE, 2).unwrap());
    let sessions = Arc::new(SessionStore::new(
        Database::in_memory().unwrap(),
        Duration::from_secs(300),
        lock_wait,
    ));
    ConversationEngine::new(knowledge, sessions, audio.map(Arc::new))
}

fn engine() -> ConversationEngine {
    engine_with(Duration::from_secs(5), None)
}

async fn say(engine: &ConversationEngine, sender: &str, text: &str) -> String {
    engine.handle_message(sender, Payload::Text(text.to_string())).await
}

fn session(engine: &ConversationEngine, sender: &str) -> Session {
    engine.sessions().peek(sender, Utc::now()).unwrap().expect("session exists")
}

fn voice() -> Payload {
    Payload::Voice { data: b"OggS fake".to_vec(), format: AudioFormat::OggOpus }
}

// =============================================================================
// WORKED EXAMPLE
// =============================================================================

mod wheat_example {
    use super::*;

    #[tokio::test]
    async fn test_varieties_lists_both() {
        let engine = engine();
        let reply = say(&engine, SENDER, "varieties of wheat").await;
        assert!(reply.contains("HD-2967"), "{reply}");
        assert!(reply.contains("PBW-343"), "{reply}");
    }

    #[tokio::test]
    async fn test_sowing_time_in_one_turn() {
        let engine = engine();
        let reply = say(&engine, SENDER, "sowing time for wheat in north").await;
        assert!(reply.contains("Nov-Dec"), "{reply}");
        assert_eq!(session(&engine, SENDER).state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_sowing_time_asks_for_region() {
        let engine = engine();
        let reply = say(&engine, SENDER, "sowing time for wheat").await;
        assert!(reply.contains("Which region"), "{reply}");

        let s = session(&engine, SENDER);
        assert_eq!(s.state, SessionState::AwaitingRegion);
        assert_eq!(s.pending_query, Some(PendingQuery::new(QueryKind::SowingTime).with_crop("wheat")));

        let reply = say(&engine, SENDER, "north").await;
        assert!(reply.contains("Nov-Dec"), "{reply}");

        let s = session(&engine, SENDER);
        assert_eq!(s.state, SessionState::Idle);
        assert_eq!(s.pending_query, None);
        assert_eq!(s.turns, 2);
    }
}

// =============================================================================
// SLOT FILLING
// =============================================================================

mod slot_filling {
    use super::*;

    #[tokio::test]
    async fn test_multi_turn_matches_single_turn_for_every_crop_and_region() {
        let engine = engine();
        let knowledge = KnowledgeStore::from_json(CATALOGUE, TABLE, 2).unwrap();

        let mut n = 0;
        for crop in knowledge.crops() {
            for region in crop.sowing.keys() {
                n += 1;
                let one_shot = say(&engine, &format!("a{n}"), &format!("sowing time for {} in {}", crop.name, region)).await;
                assert!(one_shot.contains(&crop.sowing[region]), "{one_shot}");

                let sender = format!("b{n}");
                say(&engine, &sender, &format!("sowing time for {}", crop.name)).await;
                let two_turns = say(&engine, &sender, region).await;
                assert_eq!(two_turns, one_shot);

                let sender = format!("c{n}");
                say(&engine, &sender, "sowing time").await;
                say(&engine, &sender, &crop.name).await;
                let three_turns = say(&engine, &sender, region).await;
                assert_eq!(three_turns, one_shot);
            }
        }
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn test_transitions_reported() {
        let engine = engine();
        let at = Utc::now();

        let outcome = engine.turn(&InboundEvent::text(SENDER, "varieties", at)).await.unwrap();
        assert_eq!((outcome.from, outcome.to), (SessionState::Idle, SessionState::AwaitingCrop));

        let outcome = engine.turn(&InboundEvent::text(SENDER, "bajra", at)).await.unwrap();
        assert_eq!((outcome.from, outcome.to), (SessionState::AwaitingCrop, SessionState::Complete));
        assert!(outcome.reply.contains("HHB-67"));

        // Complete is never persisted.
        assert_eq!(session(&engine, SENDER).state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_still_incomplete_reprompts() {
        let engine = engine();
        say(&engine, SENDER, "sowing time").await;
        let reply = say(&engine, SENDER, "sowing time").await;
        assert!(reply.contains("Which crop"), "{reply}");
        assert_eq!(session(&engine, SENDER).state, SessionState::AwaitingCrop);
    }

    #[tokio::test]
    async fn test_follow_up_naming_another_crop_switches_crop() {
        let engine = engine();
        let reply = say(&engine, SENDER, "sowing time for bajra").await;
        assert!(reply.contains("Pearl Millet"), "{reply}");

        let reply = say(&engine, SENDER, "wheat in north").await;
        assert!(reply.contains("Nov-Dec"), "{reply}");
        assert_eq!(session(&engine, SENDER).pending_query, None);
    }

    #[tokio::test]
    async fn test_hinglish_follow_up() {
        let engine = engine();
        say(&engine, SENDER, "gehu ki buvai kab karein").await;
        let reply = say(&engine, SENDER, "north mein").await;
        assert!(reply.contains("Nov-Dec"), "{reply}");
    }
}

// =============================================================================
// UNRECOGNIZED INPUT
// =============================================================================

mod unrecognized {
    use super::*;

    #[tokio::test]
    async fn test_unrecognized_keeps_pending_query() {
        let engine = engine();
        say(&engine, SENDER, "sowing time for wheat").await;
        let pending = session(&engine, SENDER).pending_query;

        let reply = say(&engine, SENDER, "what is the weather like").await;
        assert!(reply.contains("did not understand"), "{reply}");

        let s = session(&engine, SENDER);
        assert_eq!(s.state, SessionState::Idle);
        assert_eq!(s.pending_query, pending);

        let reply = say(&engine, SENDER, "north").await;
        assert!(reply.contains("Nov-Dec"), "{reply}");
    }

    #[tokio::test]
    async fn test_unrecognized_without_pending() {
        let engine = engine();
        let reply = say(&engine, SENDER, "asdf").await;
        assert!(reply.contains("Try asking"), "{reply}");
        assert_eq!(session(&engine, SENDER).pending_query, None);
    }
}

// =============================================================================
// NOT FOUND
// =============================================================================

mod not_found {
    use super::*;

    #[tokio::test]
    async fn test_unknown_crop_resets() {
        let engine = engine();
        say(&engine, SENDER, "sowing time").await;
        let reply = say(&engine, SENDER, "varieties of tomato").await;
        assert!(reply.contains("no data for \"tomato\""), "{reply}");

        let s = session(&engine, SENDER);
        assert_eq!(s.state, SessionState::Idle);
        assert_eq!(s.pending_query, None);
    }

    #[tokio::test]
    async fn test_unknown_crop_is_not_asked_for_region() {
        let engine = engine();
        let reply = say(&engine, SENDER, "sowing time for tomato").await;
        assert!(reply.contains("no data"), "{reply}");
        assert_eq!(session(&engine, SENDER).state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_crop_without_sowing_data() {
        let engine = engine();
        let reply = say(&engine, SENDER, "sowing time for barley").await;
        assert!(reply.contains("no sowing regions data for Barley"), "{reply}");
    }

    #[tokio::test]
    async fn test_unknown_region_in_one_turn() {
        let engine = engine();
        let reply = say(&engine, SENDER, "sowing time for wheat in kerala").await;
        assert!(reply.contains("no sowing data for wheat in kerala"), "{reply}");
        assert_eq!(session(&engine, SENDER).pending_query, None);
    }

    #[tokio::test]
    async fn test_fuzzy_crop_answers() {
        let engine = engine();
        let reply = say(&engine, SENDER, "varieties of wheet").await;
        assert!(reply.contains("HD-2967"), "{reply}");
    }
}

// =============================================================================
// GREETING AND RESET
// =============================================================================

mod greeting_and_reset {
    use super::*;

    #[tokio::test]
    async fn test_greeting_leaves_state_alone() {
        let engine = engine();
        say(&engine, SENDER, "sowing time for wheat").await;
        let reply = say(&engine, SENDER, "namaste").await;
        assert!(reply.contains("Namaste"), "{reply}");

        let s = session(&engine, SENDER);
        assert_eq!(s.state, SessionState::AwaitingRegion);
        assert!(s.pending_query.is_some());
    }

    #[tokio::test]
    async fn test_reset_clears_pending() {
        let engine = engine();
        say(&engine, SENDER, "sowing time for wheat").await;
        let reply = say(&engine, SENDER, "start over").await;
        assert!(reply.contains("start over"), "{reply}");

        let s = session(&engine, SENDER);
        assert_eq!(s.state, SessionState::Idle);
        assert_eq!(s.pending_query, None);

        // "north" no longer completes anything.
        let reply = say(&engine, SENDER, "north").await;
        assert!(!reply.contains("Nov-Dec"), "{reply}");
    }
}

// =============================================================================
// VOICE
// =============================================================================

mod voice {
    use super::*;

    #[tokio::test]
    async fn test_voice_message_is_answered() {
        let audio = normalizer("sowing time for wheat in north", Duration::ZERO, Duration::from_secs(5));
        let engine = engine_with(Duration::from_secs(5), Some(audio));
        let reply = engine.handle_message(SENDER, voice()).await;
        assert!(reply.contains("Nov-Dec"), "{reply}");
    }

    #[tokio::test]
    async fn test_timeout_leaves_session_unchanged() {
        let audio = normalizer("north", Duration::from_secs(10), Duration::from_millis(50));
        let engine = engine_with(Duration::from_secs(5), Some(audio));

        say(&engine, SENDER, "sowing time for wheat").await;
        let before = session(&engine, SENDER);

        let reply = engine.handle_message(SENDER, voice()).await;
        assert!(reply.contains("could not understand the audio"), "{reply}");

        let mut after = session(&engine, SENDER);
        assert!(after.last_activity >= before.last_activity);
        after.last_activity = before.last_activity;
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_abandoned_transcription_leaves_session_and_lease_alone() {
        let audio = normalizer("north", Duration::from_secs(10), Duration::from_secs(30));
        let engine = engine_with(Duration::from_secs(5), Some(audio));

        say(&engine, SENDER, "sowing time for wheat").await;
        let before = session(&engine, SENDER);

        let dropped = tokio::time::timeout(Duration::from_millis(50), engine.handle_message(SENDER, voice())).await;
        assert!(dropped.is_err(), "transcription should still be running");

        assert_eq!(session(&engine, SENDER), before);
        let lease = tokio::time::timeout(Duration::from_millis(10), engine.sessions().acquire(SENDER))
            .await
            .expect("lease is free");
        assert!(lease.is_ok());
    }

    #[tokio::test]
    async fn test_voice_without_backend() {
        let engine = engine();
        let reply = engine.handle_message(SENDER, voice()).await;
        assert!(reply.contains("Please type"), "{reply}");
        assert_eq!(session(&engine, SENDER).turns, 0);
    }
}

// =============================================================================
// CONCURRENCY
// =============================================================================

mod concurrency {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_sender_events_are_serialized() {
        let engine = Arc::new(engine());
        let n = 25;

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let engine = engine.clone();
                let text = if i % 2 == 0 { "sowing time for wheat" } else { "north" };
                tokio::spawn(async move { engine.handle_message(SENDER, Payload::Text(text.into())).await })
            })
            .collect();
        for h in handles {
            let reply = h.await.unwrap();
            assert_ne!(reply, replies::busy());
        }

        let s = session(&engine, SENDER);
        assert_eq!(s.turns, n);
        // Whatever order the turns ran in, the session is one of the two
        // consistent shapes, never a mix.
        match s.state {
            SessionState::Idle => assert_eq!(s.pending_query, None),
            SessionState::AwaitingRegion => {
                assert_eq!(s.pending_query, Some(PendingQuery::new(QueryKind::SowingTime).with_crop("wheat")))
            }
            other => panic!("unexpected state {other}"),
        }
    }

    #[tokio::test]
    async fn test_busy_sender_is_rejected() {
        let engine = engine_with(Duration::from_millis(50), None);
        let lease = engine.sessions().acquire(SENDER).await.unwrap();

        let reply = say(&engine, SENDER, "varieties of wheat").await;
        assert_eq!(reply, replies::busy());

        // Other senders are not blocked.
        let reply = say(&engine, "919800000002", "varieties of wheat").await;
        assert!(reply.contains("HD-2967"));

        drop(lease);
        let reply = say(&engine, SENDER, "varieties of wheat").await;
        assert!(reply.contains("HD-2967"));
    }
}

// =============================================================================
// EXPIRY
// =============================================================================

mod expiry {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_session_expires_after_ttl() {
        let engine = engine();
        engine.turn(&InboundEvent::text(SENDER, "sowing time for wheat", at(0))).await.unwrap();

        // Within the TTL the follow-up completes.
        let other = "919800000002";
        engine.turn(&InboundEvent::text(other, "sowing time for wheat", at(0))).await.unwrap();
        let outcome = engine.turn(&InboundEvent::text(other, "north", at(299))).await.unwrap();
        assert_eq!(outcome.to, SessionState::Complete);

        // Past it the session starts over.
        let outcome = engine.turn(&InboundEvent::text(SENDER, "north", at(301))).await.unwrap();
        assert_eq!(outcome.from, SessionState::Idle);
        assert!(!outcome.reply.contains("Nov-Dec"));
    }

    #[tokio::test]
    async fn test_expire_stale_removes_idle_sessions() {
        let engine = engine();
        engine.turn(&InboundEvent::text("old", "hello", at(0))).await.unwrap();
        engine.turn(&InboundEvent::text("new", "hello", at(250))).await.unwrap();

        assert_eq!(engine.sessions().expire_stale(at(400)).unwrap(), 1);
        assert_eq!(engine.sessions().session_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_expires_in_background() {
        let mut engine = engine();
        let long_ago = Utc::now() - chrono::Duration::seconds(3600);
        engine.turn(&InboundEvent::text(SENDER, "hello", long_ago)).await.unwrap();
        assert_eq!(engine.sessions().session_count().unwrap(), 1);

        engine.start_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.sessions().session_count().unwrap(), 0);
    }
}
