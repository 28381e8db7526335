use brain_memory_engine::MemoryEngine;
use brain_memory_schemas::{AdmitRequest, Channel, ConceptHit, Salience, UserId};
use chrono::{Duration, Utc};

fn request(user: &str, content: &str, concept: &str, sent_at: chrono::DateTime<chrono::Utc>) -> AdmitRequest {
    AdmitRequest {
        user_id: UserId(user.into()),
        channel: Channel::Chat,
        content: content.into(),
        sent_at,
        concepts: vec![ConceptHit {
            concept_name: concept.into(),
            confidence: 0.9,
        }],
        intent: None,
        salience: Some(Salience::Mention),
    }
}

/// Walk one message through the whole lifecycle: admission into working
/// memory, thread indexing, concept activation, consolidation on week exit
/// and archival once it is old and weak.
#[test]
fn test_message_lifecycle_end_to_end() {
    let engine = MemoryEngine::new();
    let user = UserId("user_a".into());
    let t0 = Utc::now() - Duration::days(12);

    let context = engine
        .admit(request("user_a", "kick off project phoenix", "phoenix", t0), t0)
        .unwrap();
    assert_eq!(context.working_memory.recent_messages.len(), 1);
    assert_eq!(context.episodic_memory.conversation_threads.len(), 1);
    assert_eq!(context.semantic_memory.activated_concepts.len(), 1);

    // Eight days later the message has left the current-week bucket and its
    // thread has long been quiet, so one sweep consolidates it.
    let t1 = t0 + Duration::days(8);
    let report = engine.sweep(t1);
    assert_eq!(
        report.consolidating_to_consolidated, 1,
        "week exit plus a closed thread should consolidate in one pass"
    );

    // Past the episodic window with no repetitions its retention score has
    // decayed below threshold.
    let now = Utc::now();
    let report = engine.sweep(now);
    assert_eq!(report.consolidated_to_archived, 1);
    assert_eq!(engine.queue_depth(), 0);

    // A new admission rebuilds a live context; the old concept has decayed
    // out of the active set.
    let context = engine
        .admit(request("user_a", "dentist on friday", "dentist", now), now)
        .unwrap();
    assert_eq!(context.working_memory.recent_messages.len(), 2);
    let active: Vec<&str> = context
        .semantic_memory
        .activated_concepts
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(active, vec!["dentist"]);

    // Archived items stay out of the in-flight queue but keep their terminal
    // state visible.
    let counts = engine.state_counts();
    assert_eq!(counts.get("archived"), Some(&1));
    assert_eq!(counts.get("fresh"), Some(&1));

    // The old message is past the current week but inside the 21-day window.
    let view = engine.build_context(&user, Channel::Chat, now);
    assert_eq!(view.working_memory.time_window_stats.previous_week_count, 1);
    assert_eq!(view.working_memory.time_window_stats.current_week_count, 1);
}

/// Two users sharing a process never see each other's memory.
#[test]
fn test_lifecycle_is_per_user() {
    let engine = MemoryEngine::new();
    let now = Utc::now();

    engine
        .admit(request("user_a", "buy milk", "groceries", now), now)
        .unwrap();
    engine
        .admit(request("user_b", "book flights", "travel", now), now)
        .unwrap();

    let a = engine.build_context(&UserId("user_a".into()), Channel::Chat, now);
    let b = engine.build_context(&UserId("user_b".into()), Channel::Chat, now);

    assert_eq!(a.working_memory.recent_messages.len(), 1);
    assert_eq!(b.working_memory.recent_messages.len(), 1);
    assert_eq!(a.semantic_memory.activated_concepts[0].name, "groceries");
    assert_eq!(b.semantic_memory.activated_concepts[0].name, "travel");
}
