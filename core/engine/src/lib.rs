pub mod assembler;
pub mod consolidation;
pub mod episodic;
pub mod error;
pub mod semantic;
pub mod working;

pub use assembler::assemble;
pub use consolidation::{ConsolidationEngine, SweepReport};
pub use episodic::{EpisodicMemoryStore, EpisodicView};
pub use error::EngineError;
pub use semantic::{SemanticActivationNetwork, SemanticView};
pub use working::{AdmitOutcome, WorkingMemoryManager, WorkingView};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use brain_memory_schemas::{
    AdmitRequest, BrainMemoryContext, Channel, ConceptId, Message, Salience, UserId,
    EPISODIC_WINDOW_HOURS,
};

/// The three memory tiers plus the consolidation state machine behind one
/// facade. All time-dependent behavior takes `now` explicitly so callers and
/// tests control the clock.
#[derive(Default)]
pub struct MemoryEngine {
    pub working: WorkingMemoryManager,
    pub episodic: EpisodicMemoryStore,
    pub semantic: SemanticActivationNetwork,
    pub consolidation: ConsolidationEngine,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one message: place it in working memory, activate and associate
    /// its concepts, index it into a conversation thread, register it with
    /// consolidation and return the rebuilt context.
    pub fn admit(
        &self,
        request: AdmitRequest,
        now: DateTime<Utc>,
    ) -> Result<BrainMemoryContext, EngineError> {
        let user_id = request.user_id.clone();
        let salience = request.salience.unwrap_or(Salience::Mention);
        let message = Message::new(
            user_id.clone(),
            request.channel,
            request.content,
            request.sent_at,
        );
        let message_id = message.id.clone();

        let mut concept_ids = BTreeSet::new();
        for hit in &request.concepts {
            let id = self.semantic.activate(
                &user_id,
                &hit.concept_name,
                hit.confidence.clamp(0.0, 1.0),
                now,
            );
            concept_ids.insert(id);
        }
        let ids: Vec<ConceptId> = concept_ids.iter().copied().collect();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                self.semantic.associate(&user_id, *a, *b);
            }
        }

        let thread_id =
            self.episodic
                .index_thread(&user_id, vec![message.clone()], concept_ids.clone())?;

        // Concepts resurfacing from other threads count as repetition for the
        // items that first carried them.
        self.consolidation
            .note_repetition(&user_id, &concept_ids, Some(&thread_id));
        self.consolidation.track(
            message_id,
            user_id.clone(),
            request.channel,
            salience,
            concept_ids,
            Some(thread_id),
            now,
        );

        let outcome = self.working.admit(message, now);
        for evicted in &outcome.evicted {
            self.consolidation.note_capacity_exit(&evicted.id, now);
        }
        if request.intent.is_some() {
            self.working.set_intent(&user_id, request.intent);
        }

        Ok(self.build_context(&user_id, request.channel, now))
    }

    /// Rebuild the full context for a user. Read-only and deterministic for a
    /// fixed `now`.
    pub fn build_context(
        &self,
        user_id: &UserId,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> BrainMemoryContext {
        let working = self.working.snapshot(user_id, now);

        let activated = self.semantic.active_concepts(user_id, now);
        let active_ids: BTreeSet<ConceptId> =
            activated.iter().map(|c| c.concept_id).collect();
        let semantic = SemanticView {
            concept_associations: self.semantic.associations_map(user_id, &active_ids),
            activated_concepts: activated,
        };

        let episodic = EpisodicView {
            conversation_threads: self.episodic.recent_threads(user_id, now),
            related_episodes: self.episodic.related_episodes(
                user_id,
                &active_ids,
                EPISODIC_WINDOW_HOURS,
                false,
                now,
            ),
        };

        let (strength, score) = self.consolidation.context_strength(user_id, now);
        assemble(working, episodic, semantic, channel, strength, score, now)
    }

    /// One consolidation pass over every user: items that left the current
    /// week start consolidating, then the state machine steps forward using
    /// thread-closure confidence from the episodic store.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        for user_id in self.working.user_ids() {
            for message_id in self.working.aged_out_of_current_week(&user_id, now) {
                self.consolidation.note_capacity_exit(&message_id, now);
            }
        }

        let report = self.consolidation.sweep(now, |user_id, message_id| {
            Ok(self.episodic.closure_confidence(user_id, message_id, now))
        });
        if report.total_transitions() > 0 || report.errors > 0 {
            info!(
                "Consolidation sweep: {} started, {} consolidated, {} archived, {} errors",
                report.fresh_to_consolidating,
                report.consolidating_to_consolidated,
                report.consolidated_to_archived,
                report.errors
            );
        }
        report
    }

    pub fn queue_depth(&self) -> usize {
        self.consolidation.queue_depth()
    }

    pub fn state_counts(&self) -> BTreeMap<&'static str, usize> {
        self.consolidation.state_counts()
    }

    pub fn working_memory_size(&self) -> usize {
        self.working.total_recent_len()
    }

    pub fn active_concept_total(&self, now: DateTime<Utc>) -> usize {
        self.semantic.total_active_concepts(now)
    }
}
