use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

use brain_memory_schemas::{
    generate_concept_id, Concept, ConceptId, UserId, CONCEPT_HALF_LIFE_HOURS,
    SEMANTIC_ACTIVATION_THRESHOLD,
};

/// Point-in-time view of one user's semantic memory.
#[derive(Debug, Clone, Default)]
pub struct SemanticView {
    pub activated_concepts: Vec<Concept>,
    pub concept_associations: BTreeMap<ConceptId, BTreeSet<ConceptId>>,
}

#[derive(Debug, Clone)]
struct ConceptNode {
    concept_id: ConceptId,
    name: String,
    activation_score: f64,
    last_activated_at: DateTime<Utc>,
    associations: BTreeSet<ConceptId>,
}

impl ConceptNode {
    /// Exponential decay applied lazily at read time. Half-life is tuned so a
    /// fully activated concept drops below the activation threshold after one
    /// untouched episodic window.
    fn decayed_score(&self, now: DateTime<Utc>) -> f64 {
        let elapsed_hours = (now - self.last_activated_at).num_seconds().max(0) as f64 / 3600.0;
        self.activation_score * 0.5_f64.powf(elapsed_hours / CONCEPT_HALF_LIFE_HOURS)
    }

    fn as_concept(&self, now: DateTime<Utc>) -> Concept {
        Concept {
            concept_id: self.concept_id,
            name: self.name.clone(),
            activation_score: self.decayed_score(now),
            associations: self.associations.clone(),
        }
    }
}

#[derive(Default)]
struct UserConcepts {
    nodes: HashMap<ConceptId, ConceptNode>,
    by_name: HashMap<String, ConceptId>,
}

/// Per-user spreading-activation network over extracted concepts. Scores
/// decay exponentially between activations and are recomputed on read, so no
/// background task touches the graph.
#[derive(Default)]
pub struct SemanticActivationNetwork {
    users: Mutex<HashMap<UserId, Arc<Mutex<UserConcepts>>>>,
}

impl SemanticActivationNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn user_state(&self, user_id: &UserId) -> Arc<Mutex<UserConcepts>> {
        let mut users = self.users.lock().expect("semantic map poisoned");
        Arc::clone(users.entry(user_id.clone()).or_default())
    }

    /// Boost a concept by name, creating it on first mention. The stored
    /// score is the decayed value plus the boost, capped at 1.0.
    pub fn activate(
        &self,
        user_id: &UserId,
        name: &str,
        weight: f64,
        now: DateTime<Utc>,
    ) -> ConceptId {
        let key = name.trim().to_lowercase();
        let state = self.user_state(user_id);
        let mut state = state.lock().expect("user concepts poisoned");

        if let Some(id) = state.by_name.get(&key).copied() {
            let node = state.nodes.get_mut(&id).expect("by_name index out of sync");
            node.activation_score = (node.decayed_score(now) + weight).min(1.0);
            node.last_activated_at = now;
            return id;
        }

        let id = generate_concept_id();
        debug!("New concept '{}' for {}", key, user_id);
        state.nodes.insert(
            id,
            ConceptNode {
                concept_id: id,
                name: key.clone(),
                activation_score: weight.min(1.0),
                last_activated_at: now,
                associations: BTreeSet::new(),
            },
        );
        state.by_name.insert(key, id);
        id
    }

    /// Record an undirected association between two concepts. Unknown IDs and
    /// self-links are ignored.
    pub fn associate(&self, user_id: &UserId, a: ConceptId, b: ConceptId) {
        if a == b {
            return;
        }
        let state = self.user_state(user_id);
        let mut state = state.lock().expect("user concepts poisoned");
        if !state.nodes.contains_key(&a) || !state.nodes.contains_key(&b) {
            return;
        }
        state.nodes.get_mut(&a).expect("checked").associations.insert(b);
        state.nodes.get_mut(&b).expect("checked").associations.insert(a);
    }

    /// Concepts at or above the activation threshold, strongest first.
    pub fn active_concepts(&self, user_id: &UserId, now: DateTime<Utc>) -> Vec<Concept> {
        let state = self.user_state(user_id);
        let state = state.lock().expect("user concepts poisoned");
        let mut concepts: Vec<Concept> = state
            .nodes
            .values()
            .map(|node| node.as_concept(now))
            .filter(|c| c.activation_score >= SEMANTIC_ACTIVATION_THRESHOLD)
            .collect();
        concepts.sort_by(|a, b| {
            b.activation_score
                .partial_cmp(&a.activation_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        concepts
    }

    /// The `n` strongest concepts regardless of threshold.
    pub fn top_activated(&self, user_id: &UserId, n: usize, now: DateTime<Utc>) -> Vec<Concept> {
        let state = self.user_state(user_id);
        let state = state.lock().expect("user concepts poisoned");
        let mut concepts: Vec<Concept> =
            state.nodes.values().map(|node| node.as_concept(now)).collect();
        concepts.sort_by(|a, b| {
            b.activation_score
                .partial_cmp(&a.activation_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        concepts.truncate(n);
        concepts
    }

    /// Adjacency sets for the given concepts.
    pub fn associations_map(
        &self,
        user_id: &UserId,
        concept_ids: &BTreeSet<ConceptId>,
    ) -> BTreeMap<ConceptId, BTreeSet<ConceptId>> {
        let state = self.user_state(user_id);
        let state = state.lock().expect("user concepts poisoned");
        concept_ids
            .iter()
            .filter_map(|id| state.nodes.get(id).map(|n| (*id, n.associations.clone())))
            .collect()
    }

    pub fn lookup_by_name(&self, user_id: &UserId, name: &str) -> Option<ConceptId> {
        let key = name.trim().to_lowercase();
        let state = self.user_state(user_id);
        let state = state.lock().expect("user concepts poisoned");
        state.by_name.get(&key).copied()
    }

    pub fn active_concept_count(&self, user_id: &UserId, now: DateTime<Utc>) -> usize {
        self.active_concepts(user_id, now).len()
    }

    /// Active-concept total across every tracked user.
    pub fn total_active_concepts(&self, now: DateTime<Utc>) -> usize {
        let user_ids: Vec<UserId> = {
            let users = self.users.lock().expect("semantic map poisoned");
            users.keys().cloned().collect()
        };
        user_ids
            .iter()
            .map(|id| self.active_concept_count(id, now))
            .sum()
    }
}
