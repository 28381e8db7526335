use chrono::{DateTime, Utc};

use crate::episodic::EpisodicView;
use crate::semantic::SemanticView;
use crate::working::WorkingView;
use brain_memory_schemas::{
    BrainMemoryContext, Channel, ConsolidationMetadata, EpisodicMemorySnapshot,
    SemanticMemorySnapshot, WorkingMemorySnapshot, EPISODIC_WINDOW_HOURS,
    SEMANTIC_ACTIVATION_THRESHOLD, WORKING_MEMORY_LIMIT,
};

/// Compose the three tier views into one context object. Pure function of its
/// inputs: the same views, channel and timestamp always yield the same
/// context, and nothing here mutates tier state.
pub fn assemble(
    working: WorkingView,
    episodic: EpisodicView,
    semantic: SemanticView,
    channel: Channel,
    memory_strength: f64,
    consolidation_score: f64,
    retrieved_at: DateTime<Utc>,
) -> BrainMemoryContext {
    let context_channels = context_channels(channel, &working);
    let memory_age_hours = working
        .recent_messages
        .iter()
        .map(|m| m.sent_at)
        .min()
        .map(|oldest| (retrieved_at - oldest).num_seconds().max(0) as f64 / 3600.0)
        .unwrap_or(0.0);

    BrainMemoryContext {
        working_memory: WorkingMemorySnapshot {
            recent_messages: working.recent_messages,
            time_window_messages: working.time_window_messages,
            recently_modified_messages: working.recently_modified_messages,
            active_concepts: semantic.activated_concepts.clone(),
            current_intent: working.current_intent,
            time_window_stats: working.time_window_stats,
        },
        episodic_memory: EpisodicMemorySnapshot {
            conversation_threads: episodic.conversation_threads,
            related_episodes: episodic.related_episodes,
        },
        semantic_memory: SemanticMemorySnapshot {
            activated_concepts: semantic.activated_concepts,
            concept_associations: semantic.concept_associations,
        },
        consolidation_metadata: ConsolidationMetadata {
            retrieval_timestamp: retrieved_at,
            memory_strength,
            context_channels,
            memory_age_hours,
            consolidation_score,
            working_memory_limit: WORKING_MEMORY_LIMIT,
            episodic_window_hours: EPISODIC_WINDOW_HOURS,
            semantic_activation_threshold: SEMANTIC_ACTIVATION_THRESHOLD,
        },
    }
}

/// The requesting channel always leads, followed by every other channel
/// present in recent working memory.
fn context_channels(requesting: Channel, working: &WorkingView) -> Vec<Channel> {
    let mut channels = vec![requesting];
    for message in &working.recent_messages {
        if !channels.contains(&message.channel) {
            channels.push(message.channel);
        }
    }
    channels
}
