use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::EngineError;
use brain_memory_schemas::{
    Channel, ConceptId, ConsolidationState, MessageId, Salience, ThreadId, UserId,
    EPISODIC_WINDOW_HOURS, RETENTION_THRESHOLD, WEEK_BUCKET_DAYS,
};

/// One tracked working-memory item moving through the consolidation
/// lifecycle. States only move forward.
#[derive(Debug, Clone)]
pub struct ConsolidationRecord {
    pub user_id: UserId,
    pub state: ConsolidationState,
    pub admitted_at: DateTime<Utc>,
    pub channel: Channel,
    pub salience: Salience,
    pub concepts: BTreeSet<ConceptId>,
    pub thread_id: Option<ThreadId>,
    pub repetitions: u32,
    pub memory_strength: f64,
    pub closure_confidence: f64,
    pub consolidation_score: f64,
    pub last_transition_at: DateTime<Utc>,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub fresh_to_consolidating: usize,
    pub consolidating_to_consolidated: usize,
    pub consolidated_to_archived: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn total_transitions(&self) -> usize {
        self.fresh_to_consolidating
            + self.consolidating_to_consolidated
            + self.consolidated_to_archived
    }
}

/// Tracks every admitted message through fresh, consolidating, consolidated
/// and archived. Transitions happen during sweeps or on explicit signals
/// (capacity eviction, repetition) and never run backwards.
#[derive(Default)]
pub struct ConsolidationEngine {
    records: Mutex<HashMap<MessageId, ConsolidationRecord>>,
}

impl ConsolidationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly admitted message. Re-tracking an existing message
    /// is a no-op so replayed admissions cannot reset progress.
    pub fn track(
        &self,
        message_id: MessageId,
        user_id: UserId,
        channel: Channel,
        salience: Salience,
        concepts: BTreeSet<ConceptId>,
        thread_id: Option<ThreadId>,
        admitted_at: DateTime<Utc>,
    ) {
        let mut records = self.records.lock().expect("consolidation map poisoned");
        records.entry(message_id).or_insert(ConsolidationRecord {
            user_id,
            state: ConsolidationState::Fresh,
            admitted_at,
            channel,
            salience,
            concepts,
            thread_id,
            repetitions: 0,
            memory_strength: 0.0,
            closure_confidence: 0.0,
            consolidation_score: 0.0,
            last_transition_at: admitted_at,
        });
    }

    /// A fresh item evicted from the recent deque starts consolidating
    /// immediately instead of waiting for its week to roll over.
    pub fn note_capacity_exit(&self, message_id: &MessageId, now: DateTime<Utc>) {
        let mut records = self.records.lock().expect("consolidation map poisoned");
        if let Some(record) = records.get_mut(message_id) {
            if record.state == ConsolidationState::Fresh {
                record.state = ConsolidationState::Consolidating;
                record.last_transition_at = now;
                debug!("Capacity exit moved {} to consolidating", message_id);
            }
        }
    }

    /// Credit every tracked item (outside the given thread) whose concepts
    /// overlap the newly mentioned set. Repetition feeds memory strength.
    pub fn note_repetition(
        &self,
        user_id: &UserId,
        concepts: &BTreeSet<ConceptId>,
        thread_id: Option<&ThreadId>,
    ) {
        if concepts.is_empty() {
            return;
        }
        let mut records = self.records.lock().expect("consolidation map poisoned");
        for record in records.values_mut() {
            if &record.user_id != user_id || record.state == ConsolidationState::Archived {
                continue;
            }
            if record.thread_id.as_ref() == thread_id && thread_id.is_some() {
                continue;
            }
            if !record.concepts.is_disjoint(concepts) {
                record.repetitions += 1;
            }
        }
    }

    /// Recency component with a half-life of one episodic window, so an item
    /// untouched for a week contributes half its original recency.
    fn recency(admitted_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_hours = (now - admitted_at).num_seconds().max(0) as f64 / 3600.0;
        0.5_f64.powf(age_hours / EPISODIC_WINDOW_HOURS as f64)
    }

    fn strength(record: &ConsolidationRecord, now: DateTime<Utc>) -> f64 {
        let repetition = (record.repetitions as f64 / 3.0).min(1.0);
        0.5 * Self::recency(record.admitted_at, now)
            + 0.3 * repetition
            + 0.2 * record.salience.weight()
    }

    /// Walk every record forward through all transitions it is eligible for
    /// at `now`, so a second identical sweep finds nothing left to do.
    /// `closure_fn` reports thread-closure confidence for an item, or an
    /// error when the episodic store cannot answer; errors are counted and
    /// skip only that item.
    pub fn sweep<F>(&self, now: DateTime<Utc>, closure_fn: F) -> SweepReport
    where
        F: Fn(&UserId, &MessageId) -> Result<Option<f64>, EngineError>,
    {
        let mut records = self.records.lock().expect("consolidation map poisoned");
        let mut report = SweepReport::default();
        let week = Duration::days(WEEK_BUCKET_DAYS);
        let window = Duration::hours(EPISODIC_WINDOW_HOURS);

        for (message_id, record) in records.iter_mut() {
            loop {
                match record.state {
                    ConsolidationState::Fresh => {
                        if now - record.admitted_at <= week {
                            break;
                        }
                        record.state = ConsolidationState::Consolidating;
                        record.last_transition_at = now;
                        report.fresh_to_consolidating += 1;
                    }
                    ConsolidationState::Consolidating => {
                        let closure = match closure_fn(&record.user_id, message_id) {
                            Ok(confidence) => confidence.unwrap_or(1.0),
                            Err(err) => {
                                warn!("Closure lookup failed for {}: {}", message_id, err);
                                report.errors += 1;
                                break;
                            }
                        };
                        if closure < 1.0 {
                            break;
                        }
                        record.memory_strength = Self::strength(record, now);
                        record.closure_confidence = closure.min(1.0);
                        record.consolidation_score =
                            record.memory_strength * record.closure_confidence;
                        record.state = ConsolidationState::Consolidated;
                        record.last_transition_at = now;
                        report.consolidating_to_consolidated += 1;
                    }
                    ConsolidationState::Consolidated => {
                        // Retention score is recomputed each pass so recency
                        // decay keeps eroding it.
                        record.memory_strength = Self::strength(record, now);
                        record.consolidation_score =
                            record.memory_strength * record.closure_confidence;
                        let aged_out = now - record.admitted_at > window;
                        if !(aged_out && record.consolidation_score < RETENTION_THRESHOLD) {
                            break;
                        }
                        record.state = ConsolidationState::Archived;
                        record.last_transition_at = now;
                        report.consolidated_to_archived += 1;
                    }
                    ConsolidationState::Archived => break,
                }
            }
        }

        report
    }

    /// Items still in flight (not yet consolidated or archived).
    pub fn queue_depth(&self) -> usize {
        let records = self.records.lock().expect("consolidation map poisoned");
        records
            .values()
            .filter(|r| {
                matches!(
                    r.state,
                    ConsolidationState::Fresh | ConsolidationState::Consolidating
                )
            })
            .count()
    }

    pub fn state_counts(&self) -> BTreeMap<&'static str, usize> {
        let records = self.records.lock().expect("consolidation map poisoned");
        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for record in records.values() {
            *counts.entry(record.state.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Strength and score for the user's most recently admitted item,
    /// recomputed at `now`. Used when a context snapshot is assembled.
    pub fn context_strength(&self, user_id: &UserId, now: DateTime<Utc>) -> (f64, f64) {
        let records = self.records.lock().expect("consolidation map poisoned");
        records
            .values()
            .filter(|r| &r.user_id == user_id)
            .max_by_key(|r| r.admitted_at)
            .map(|r| {
                let strength = Self::strength(r, now);
                (strength, strength * r.closure_confidence)
            })
            .unwrap_or((0.0, 0.0))
    }

    pub fn record_state(&self, message_id: &MessageId) -> Option<ConsolidationState> {
        let records = self.records.lock().expect("consolidation map poisoned");
        records.get(message_id).map(|r| r.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brain_memory_schemas::generate_message_id;

    fn user() -> UserId {
        UserId("user_a".into())
    }

    fn track_at(engine: &ConsolidationEngine, admitted_at: DateTime<Utc>) -> MessageId {
        let id = generate_message_id();
        engine.track(
            id.clone(),
            user(),
            Channel::Chat,
            Salience::Mention,
            BTreeSet::new(),
            None,
            admitted_at,
        );
        id
    }

    fn always_closed(_: &UserId, _: &MessageId) -> Result<Option<f64>, EngineError> {
        Ok(Some(1.0))
    }

    #[test]
    fn test_track_is_idempotent() {
        let engine = ConsolidationEngine::new();
        let now = Utc::now();
        let id = track_at(&engine, now);
        engine.note_capacity_exit(&id, now);

        // Replayed admission must not reset the state.
        engine.track(
            id.clone(),
            user(),
            Channel::Sms,
            Salience::Passive,
            BTreeSet::new(),
            None,
            now,
        );
        assert_eq!(engine.record_state(&id), Some(ConsolidationState::Consolidating));
    }

    #[test]
    fn test_week_exit_starts_consolidation() {
        let engine = ConsolidationEngine::new();
        let now = Utc::now();
        let old = track_at(&engine, now - Duration::days(8));
        let young = track_at(&engine, now - Duration::days(2));

        // An open thread keeps the week-old item in consolidating.
        let report = engine.sweep(now, |_, _| Ok(Some(0.2)));
        assert_eq!(report.fresh_to_consolidating, 1);
        assert_eq!(report.consolidating_to_consolidated, 0);
        assert_eq!(engine.record_state(&old), Some(ConsolidationState::Consolidating));
        assert_eq!(engine.record_state(&young), Some(ConsolidationState::Fresh));
    }

    #[test]
    fn test_closure_gates_consolidation() {
        let engine = ConsolidationEngine::new();
        let now = Utc::now();
        let id = track_at(&engine, now - Duration::days(1));
        engine.note_capacity_exit(&id, now);

        let report = engine.sweep(now, |_, _| Ok(Some(0.5)));
        assert_eq!(report.consolidating_to_consolidated, 0);
        assert_eq!(engine.record_state(&id), Some(ConsolidationState::Consolidating));

        let report = engine.sweep(now, always_closed);
        assert_eq!(report.consolidating_to_consolidated, 1);
        assert_eq!(engine.record_state(&id), Some(ConsolidationState::Consolidated));
    }

    #[test]
    fn test_weak_old_items_are_archived() {
        let engine = ConsolidationEngine::new();
        let now = Utc::now();
        let id = track_at(&engine, now - Duration::days(12));

        // Twelve days old, thread closed, no repetitions: recency has decayed
        // far enough that one sweep carries it all the way to archived.
        let report = engine.sweep(now, always_closed);
        assert_eq!(report.fresh_to_consolidating, 1);
        assert_eq!(report.consolidating_to_consolidated, 1);
        assert_eq!(report.consolidated_to_archived, 1);
        assert_eq!(engine.record_state(&id), Some(ConsolidationState::Archived));
        assert_eq!(engine.queue_depth(), 0);
    }

    #[test]
    fn test_sweep_is_idempotent_on_unchanged_data() {
        let engine = ConsolidationEngine::new();
        let now = Utc::now();
        let id = track_at(&engine, now - Duration::days(8));

        // One pass exhausts every eligible transition: week exit, then
        // consolidation (closure defaults to closed for an unindexed item).
        // Eight days old is strong enough to be retained.
        let first = engine.sweep(now, |_, _| Ok(None));
        assert_eq!(first.fresh_to_consolidating, 1);
        assert_eq!(first.consolidating_to_consolidated, 1);
        assert_eq!(first.consolidated_to_archived, 0);
        assert_eq!(engine.record_state(&id), Some(ConsolidationState::Consolidated));

        // Back-to-back rerun on the unchanged set transitions nothing.
        let second = engine.sweep(now, |_, _| Ok(None));
        assert_eq!(second.total_transitions(), 0);
    }

    #[test]
    fn test_closure_errors_skip_only_the_failing_item() {
        let engine = ConsolidationEngine::new();
        let now = Utc::now();
        let failing = track_at(&engine, now - Duration::days(1));
        let healthy = track_at(&engine, now - Duration::days(1));
        engine.note_capacity_exit(&failing, now);
        engine.note_capacity_exit(&healthy, now);

        let failing_id = failing.clone();
        let report = engine.sweep(now, move |_, id| {
            if id == &failing_id {
                Err(EngineError::UnknownMessage(id.to_string()))
            } else {
                Ok(Some(1.0))
            }
        });

        assert_eq!(report.errors, 1);
        assert_eq!(report.consolidating_to_consolidated, 1);
        assert_eq!(engine.record_state(&failing), Some(ConsolidationState::Consolidating));
        assert_eq!(engine.record_state(&healthy), Some(ConsolidationState::Consolidated));
    }

    #[test]
    fn test_repetition_credits_overlapping_items_in_other_threads() {
        let engine = ConsolidationEngine::new();
        let now = Utc::now();
        let concept = brain_memory_schemas::generate_concept_id();
        let concepts: BTreeSet<ConceptId> = [concept].into_iter().collect();

        let thread_a = brain_memory_schemas::generate_thread_id();
        let thread_b = brain_memory_schemas::generate_thread_id();

        let in_a = generate_message_id();
        engine.track(
            in_a.clone(),
            user(),
            Channel::Chat,
            Salience::Mention,
            concepts.clone(),
            Some(thread_a.clone()),
            now,
        );

        // Mention from a different thread counts, same thread does not.
        engine.note_repetition(&user(), &concepts, Some(&thread_b));
        engine.note_repetition(&user(), &concepts, Some(&thread_a));

        let records = engine.records.lock().unwrap();
        assert_eq!(records[&in_a].repetitions, 1);
    }
}
