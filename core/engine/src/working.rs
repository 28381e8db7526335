use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

use brain_memory_schemas::{
    Message, MessageId, TimeWindowBuckets, TimeWindowStats, UserId, TIME_WINDOW_DAYS,
    WEEK_BUCKET_DAYS, WORKING_MEMORY_LIMIT,
};

/// Point-in-time view of one user's working memory, consumed by the
/// context assembler.
#[derive(Debug, Clone, Default)]
pub struct WorkingView {
    pub recent_messages: Vec<Message>,
    pub time_window_messages: TimeWindowBuckets,
    pub recently_modified_messages: Vec<Message>,
    pub current_intent: Option<String>,
    pub time_window_stats: TimeWindowStats,
}

#[derive(Debug, Default)]
struct UserWorkingMemory {
    /// Strict FIFO by wall-clock sent_at, capped at WORKING_MEMORY_LIMIT.
    recent: VecDeque<Message>,
    /// Independent 21-day window, also ordered by sent_at. Deliberately a
    /// separate view: the deque is recency-biased, the window is
    /// thematic-width-biased.
    window: Vec<Message>,
    current_intent: Option<String>,
}

/// What an admit displaced, fed into the consolidation engine.
#[derive(Debug, Default)]
pub struct AdmitOutcome {
    pub evicted: Vec<Message>,
}

/// Bounds recent conversational context per user. Mutations for one user are
/// linearized behind a per-user mutex; different users never contend.
#[derive(Default)]
pub struct WorkingMemoryManager {
    users: Mutex<HashMap<UserId, Arc<Mutex<UserWorkingMemory>>>>,
}

impl WorkingMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn user_state(&self, user_id: &UserId) -> Arc<Mutex<UserWorkingMemory>> {
        let mut users = self.users.lock().expect("working memory map poisoned");
        Arc::clone(users.entry(user_id.clone()).or_default())
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        let users = self.users.lock().expect("working memory map poisoned");
        users.keys().cloned().collect()
    }

    /// Admit one message. Admits from different channels interleave by
    /// wall-clock sent_at, never by per-channel arrival order.
    pub fn admit(&self, message: Message, now: DateTime<Utc>) -> AdmitOutcome {
        let state = self.user_state(&message.user_id);
        let mut state = state.lock().expect("user working memory poisoned");

        // Insert preserving sent_at order in both views.
        let recent_pos = state
            .recent
            .iter()
            .rposition(|m| m.sent_at <= message.sent_at)
            .map(|p| p + 1)
            .unwrap_or(0);
        state.recent.insert(recent_pos, message.clone());

        let window_pos = state
            .window
            .iter()
            .rposition(|m| m.sent_at <= message.sent_at)
            .map(|p| p + 1)
            .unwrap_or(0);
        state.window.insert(window_pos, message.clone());

        let mut evicted = Vec::new();
        while state.recent.len() > WORKING_MEMORY_LIMIT {
            if let Some(oldest) = state.recent.pop_front() {
                debug!("Working memory evicted {} for {}", oldest.id, message.user_id);
                evicted.push(oldest);
            }
        }

        let cutoff = now - Duration::days(TIME_WINDOW_DAYS);
        state.window.retain(|m| m.sent_at >= cutoff);

        AdmitOutcome { evicted }
    }

    pub fn set_intent(&self, user_id: &UserId, intent: Option<String>) {
        let state = self.user_state(user_id);
        let mut state = state.lock().expect("user working memory poisoned");
        state.current_intent = intent;
    }

    /// Mark a message modified so it surfaces in the recently-modified view.
    /// Returns false when the message is no longer in working memory.
    pub fn touch(&self, user_id: &UserId, message_id: &MessageId, modified_at: DateTime<Utc>) -> bool {
        let state = self.user_state(user_id);
        let mut state = state.lock().expect("user working memory poisoned");

        let mut touched = false;
        let state = &mut *state;
        for m in state.recent.iter_mut().chain(state.window.iter_mut()) {
            if &m.id == message_id {
                m.modified_at = modified_at;
                touched = true;
            }
        }
        touched
    }

    /// Message IDs that have aged out of the current-week bucket; the sweep
    /// uses this to start consolidating them.
    pub fn aged_out_of_current_week(&self, user_id: &UserId, now: DateTime<Utc>) -> Vec<MessageId> {
        let state = self.user_state(user_id);
        let state = state.lock().expect("user working memory poisoned");
        let week_ago = now - Duration::days(WEEK_BUCKET_DAYS);
        state
            .window
            .iter()
            .filter(|m| m.sent_at < week_ago)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn snapshot(&self, user_id: &UserId, now: DateTime<Utc>) -> WorkingView {
        let state = self.user_state(user_id);
        let state = state.lock().expect("user working memory poisoned");

        let week_ago = now - Duration::days(WEEK_BUCKET_DAYS);
        let mut buckets = TimeWindowBuckets::default();
        for m in &state.window {
            if m.sent_at > now {
                buckets.next_week.push(m.clone());
            } else if m.sent_at >= week_ago {
                buckets.current_week.push(m.clone());
            } else {
                // Bucket edges absorb the window bounds: everything older
                // than the current week but still inside the 21-day window.
                buckets.previous_week.push(m.clone());
            }
        }

        // Indexed by modified_at, not sent_at: surfaces edits to items the
        // user has already seen.
        let mut recently_modified: Vec<Message> = state
            .window
            .iter()
            .filter(|m| m.modified_at > m.sent_at && m.modified_at >= week_ago)
            .cloned()
            .collect();
        recently_modified.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));

        let stats = TimeWindowStats {
            previous_week_count: buckets.previous_week.len(),
            current_week_count: buckets.current_week.len(),
            next_week_count: buckets.next_week.len(),
            recently_modified_count: recently_modified.len(),
        };

        WorkingView {
            recent_messages: state.recent.iter().cloned().collect(),
            time_window_messages: buckets,
            recently_modified_messages: recently_modified,
            current_intent: state.current_intent.clone(),
            time_window_stats: stats,
        }
    }

    /// Total recent-deque occupancy across users, for the metrics surface.
    pub fn total_recent_len(&self) -> usize {
        let users: Vec<_> = {
            let map = self.users.lock().expect("working memory map poisoned");
            map.values().cloned().collect()
        };
        users
            .iter()
            .map(|state| state.lock().expect("user working memory poisoned").recent.len())
            .sum()
    }
}
