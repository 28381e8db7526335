use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::EngineError;
use brain_memory_schemas::{
    ConceptId, ConversationThread, Episode, Message, MessageId, ThreadId, UserId,
    generate_thread_id, EPISODIC_WINDOW_HOURS, QUIET_GAP_MINUTES,
};

/// Point-in-time view of one user's episodic memory.
#[derive(Debug, Clone, Default)]
pub struct EpisodicView {
    pub conversation_threads: Vec<ConversationThread>,
    pub related_episodes: Vec<Episode>,
}

#[derive(Debug, Clone)]
struct ThreadRecord {
    thread: ConversationThread,
    concepts: BTreeSet<ConceptId>,
}

#[derive(Default)]
struct UserEpisodes {
    threads: Vec<ThreadRecord>,
}

/// Thread-indexed conversation history. A thread is a contiguous run from one
/// user bounded by the quiet-gap threshold; episodes older than the 168-hour
/// window are retrievable only on explicit request.
#[derive(Default)]
pub struct EpisodicMemoryStore {
    users: Mutex<HashMap<UserId, Arc<Mutex<UserEpisodes>>>>,
}

impl EpisodicMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn user_state(&self, user_id: &UserId) -> Arc<Mutex<UserEpisodes>> {
        let mut users = self.users.lock().expect("episodic map poisoned");
        Arc::clone(users.entry(user_id.clone()).or_default())
    }

    /// Index a batch of messages into threads. Messages within the quiet gap
    /// of the user's latest thread extend it; anything after a longer silence
    /// opens a new thread. Returns the thread holding the final message.
    pub fn index_thread(
        &self,
        user_id: &UserId,
        messages: Vec<Message>,
        concepts: BTreeSet<ConceptId>,
    ) -> Result<ThreadId, EngineError> {
        if messages.is_empty() {
            return Err(EngineError::EmptyThread);
        }

        let state = self.user_state(user_id);
        let mut state = state.lock().expect("user episodes poisoned");
        let quiet_gap = Duration::minutes(QUIET_GAP_MINUTES);

        let mut sorted = messages;
        sorted.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));

        let mut current_id = None;
        for message in sorted {
            let extend = state
                .threads
                .last()
                .map(|record| message.sent_at - record.thread.last_activity_at <= quiet_gap)
                .unwrap_or(false);

            if extend {
                let record = state.threads.last_mut().expect("checked above");
                record.thread.last_activity_at =
                    record.thread.last_activity_at.max(message.sent_at);
                record.thread.messages.push(message);
                record.concepts.extend(concepts.iter().copied());
                current_id = Some(record.thread.thread_id.clone());
            } else {
                let thread_id = generate_thread_id();
                debug!("Opened thread {} for {}", thread_id, user_id);
                state.threads.push(ThreadRecord {
                    thread: ConversationThread {
                        thread_id: thread_id.clone(),
                        started_at: message.sent_at,
                        last_activity_at: message.sent_at,
                        messages: vec![message],
                    },
                    concepts: concepts.iter().copied().collect(),
                });
                current_id = Some(thread_id);
            }
        }

        Ok(current_id.expect("at least one message indexed"))
    }

    /// Episodes sharing concepts with the query, ranked by shared-concept
    /// count then recency. Only threads active within `within_hours` are
    /// considered unless `include_older` is set.
    pub fn related_episodes(
        &self,
        user_id: &UserId,
        concept_ids: &BTreeSet<ConceptId>,
        within_hours: i64,
        include_older: bool,
        now: DateTime<Utc>,
    ) -> Vec<Episode> {
        let state = self.user_state(user_id);
        let state = state.lock().expect("user episodes poisoned");
        let horizon = now - Duration::hours(within_hours);

        let mut episodes: Vec<Episode> = state
            .threads
            .iter()
            .filter(|record| include_older || record.thread.last_activity_at >= horizon)
            .filter_map(|record| {
                let shared = record.concepts.intersection(concept_ids).count();
                if shared == 0 {
                    return None;
                }
                Some(Episode {
                    thread_id: record.thread.thread_id.clone(),
                    started_at: record.thread.started_at,
                    last_activity_at: record.thread.last_activity_at,
                    message_count: record.thread.messages.len(),
                    shared_concept_count: shared,
                })
            })
            .collect();

        episodes.sort_by(|a, b| {
            b.shared_concept_count
                .cmp(&a.shared_concept_count)
                .then(b.last_activity_at.cmp(&a.last_activity_at))
        });
        episodes
    }

    /// Threads active within the default episodic window.
    pub fn recent_threads(&self, user_id: &UserId, now: DateTime<Utc>) -> Vec<ConversationThread> {
        let state = self.user_state(user_id);
        let state = state.lock().expect("user episodes poisoned");
        let horizon = now - Duration::hours(EPISODIC_WINDOW_HOURS);
        state
            .threads
            .iter()
            .filter(|record| record.thread.last_activity_at >= horizon)
            .map(|record| record.thread.clone())
            .collect()
    }

    /// How confidently the thread containing this message is closed: 0 while
    /// activity continues, scaling to 1 once a full quiet gap has elapsed.
    pub fn closure_confidence(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let state = self.user_state(user_id);
        let state = state.lock().expect("user episodes poisoned");
        let record = state
            .threads
            .iter()
            .find(|record| record.thread.messages.iter().any(|m| &m.id == message_id))?;

        let silence = (now - record.thread.last_activity_at).num_seconds().max(0) as f64;
        let gap = (QUIET_GAP_MINUTES * 60) as f64;
        Some((silence / gap).clamp(0.0, 1.0))
    }
}
