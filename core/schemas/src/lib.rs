use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Hard constants of the memory model
// ============================================================================

/// Maximum number of items in the per-user recent-context deque (7±2 rule).
pub const WORKING_MEMORY_LIMIT: usize = 7;

/// Rolling working-memory time window, partitioned into three 7-day buckets.
pub const TIME_WINDOW_DAYS: i64 = 21;

/// Width of one time-window bucket.
pub const WEEK_BUCKET_DAYS: i64 = 7;

/// Trailing window within which episodes are retrievable by default.
pub const EPISODIC_WINDOW_HOURS: i64 = 168;

/// A concept counts as active while its decayed score stays at or above this.
pub const SEMANTIC_ACTIVATION_THRESHOLD: f64 = 0.3;

/// Multiplicative decay half-life. 96h puts a score of 1.0 below the
/// activation threshold after one idle week (0.5^(168/96) ~= 0.297).
pub const CONCEPT_HALF_LIFE_HOURS: f64 = 96.0;

/// Silence longer than this closes a conversation thread.
pub const QUIET_GAP_MINUTES: i64 = 30;

/// TTL for cache rows of built-in data types.
pub const CACHE_TTL_DAYS: i64 = 21;

/// TTL for short-lived entity-resolution lookups.
pub const ENTITY_CACHE_TTL_SECS: u64 = 900;

/// Items past the episodic window are archived once their consolidation
/// score falls below this.
pub const RETENTION_THRESHOLD: f64 = 0.25;

/// Interval of the background consolidation sweep.
pub const SWEEP_INTERVAL_SECS: u64 = 300;

/// Upper bound on a single upstream fetch.
pub const UPSTREAM_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConceptId(pub Uuid);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn generate_message_id() -> MessageId {
    MessageId(format!("msg_{}", ulid::Ulid::new()))
}

pub fn generate_thread_id() -> ThreadId {
    ThreadId(format!("thr_{}", ulid::Ulid::new()))
}

pub fn generate_concept_id() -> ConceptId {
    ConceptId(Uuid::new_v4())
}

// ============================================================================
// Message Schema
// ============================================================================

/// Communication channel a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "sms")]
    Sms,
    #[serde(rename = "chat")]
    Chat,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Chat => "chat",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single conversational message. Immutable except `modified_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel: Channel,
    pub user_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        user_id: UserId,
        channel: Channel,
        content: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: generate_message_id(),
            channel,
            user_id,
            content: content.into(),
            sent_at,
            modified_at: sent_at,
        }
    }
}

/// Derived counts over the three-bucket time window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindowStats {
    pub previous_week_count: usize,
    pub current_week_count: usize,
    pub next_week_count: usize,
    pub recently_modified_count: usize,
}

// ============================================================================
// Episodic Schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationThread {
    pub thread_id: ThreadId,
    pub messages: Vec<Message>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// A thread summary surfaced by related-episode retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub thread_id: ThreadId,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: usize,
    pub shared_concept_count: usize,
}

// ============================================================================
// Semantic Schema
// ============================================================================

/// A concept node with decaying activation. Associations are stored as an
/// adjacency set of concept IDs, never as object references, because the
/// association graph is cyclic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub concept_id: ConceptId,
    pub name: String,
    pub activation_score: f64,
    pub associations: BTreeSet<ConceptId>,
}

/// What the external extraction service hands us per message. Consumed here,
/// never computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptHit {
    pub concept_name: String,
    pub confidence: f64,
}

// ============================================================================
// Consolidation Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConsolidationState {
    #[serde(rename = "fresh")]
    Fresh,
    #[serde(rename = "consolidating")]
    Consolidating,
    #[serde(rename = "consolidated")]
    Consolidated,
    #[serde(rename = "archived")]
    Archived,
}

impl ConsolidationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationState::Fresh => "fresh",
            ConsolidationState::Consolidating => "consolidating",
            ConsolidationState::Consolidated => "consolidated",
            ConsolidationState::Archived => "archived",
        }
    }
}

/// Explicit salience of a working-memory item. Task creation outweighs a
/// passive mention when memory strength is recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Salience {
    #[serde(rename = "passive")]
    Passive,
    #[serde(rename = "mention")]
    Mention,
    #[serde(rename = "task_creation")]
    TaskCreation,
}

impl Salience {
    pub fn weight(&self) -> f64 {
        match self {
            Salience::Passive => 0.1,
            Salience::Mention => 0.3,
            Salience::TaskCreation => 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationMetadata {
    pub retrieval_timestamp: DateTime<Utc>,
    pub memory_strength: f64,
    pub context_channels: Vec<Channel>,
    pub memory_age_hours: f64,
    pub consolidation_score: f64,
    pub working_memory_limit: usize,
    pub episodic_window_hours: i64,
    pub semantic_activation_threshold: f64,
}

// ============================================================================
// Brain Memory Context (ephemeral, rebuilt per request)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemorySnapshot {
    pub recent_messages: Vec<Message>,
    pub time_window_messages: TimeWindowBuckets,
    pub recently_modified_messages: Vec<Message>,
    pub active_concepts: Vec<Concept>,
    pub current_intent: Option<String>,
    pub time_window_stats: TimeWindowStats,
}

/// The 21-day window split into three 7-day buckets relative to now.
/// "Next week" holds future-dated items such as scheduled reminders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeWindowBuckets {
    pub previous_week: Vec<Message>,
    pub current_week: Vec<Message>,
    pub next_week: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicMemorySnapshot {
    pub conversation_threads: Vec<ConversationThread>,
    pub related_episodes: Vec<Episode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticMemorySnapshot {
    pub activated_concepts: Vec<Concept>,
    pub concept_associations: BTreeMap<ConceptId, BTreeSet<ConceptId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainMemoryContext {
    pub working_memory: WorkingMemorySnapshot,
    pub episodic_memory: EpisodicMemorySnapshot,
    pub semantic_memory: SemanticMemorySnapshot,
    pub consolidation_metadata: ConsolidationMetadata,
}

// ============================================================================
// Cache Schema
// ============================================================================

/// External record category synced through the cache. Four first-class
/// values; everything else rides through as a custom tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataType {
    Tasks,
    Contacts,
    Calendar,
    Emails,
    Custom(String),
}

impl DataType {
    pub fn as_str(&self) -> &str {
        match self {
            DataType::Tasks => "tasks",
            DataType::Contacts => "contacts",
            DataType::Calendar => "calendar",
            DataType::Emails => "emails",
            DataType::Custom(s) => s,
        }
    }

    /// Built-in data types always get the fixed 21-day TTL.
    pub fn is_builtin(&self) -> bool {
        !matches!(self, DataType::Custom(_))
    }
}

impl From<String> for DataType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "tasks" => DataType::Tasks,
            "contacts" => DataType::Contacts,
            "calendar" => DataType::Calendar,
            "emails" => DataType::Emails,
            _ => DataType::Custom(s),
        }
    }
}

impl From<DataType> for String {
    fn from(d: DataType) -> Self {
        d.as_str().to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One durable cache row. Unique on (user_id, data_type, memory_period);
/// `expires_at - created_at` is 21 days for built-in data types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub user_id: UserId,
    pub data_type: DataType,
    pub memory_period: String,
    pub cache_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub avg_response_time_ms: f64,
    pub api_calls_saved: u64,
}

/// Which path a refresh took, for stats reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchOutcome {
    #[serde(rename = "cache_hit")]
    CacheHit,
    #[serde(rename = "cache_miss")]
    CacheMiss,
    #[serde(rename = "stale_fallback")]
    StaleFallback,
    #[serde(rename = "fresh_fetch")]
    FreshFetch,
}

impl FetchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchOutcome::CacheHit => "cache_hit",
            FetchOutcome::CacheMiss => "cache_miss",
            FetchOutcome::StaleFallback => "stale_fallback",
            FetchOutcome::FreshFetch => "fresh_fetch",
        }
    }
}

// ============================================================================
// Synced payload shaping (boundary only; the cache core is payload-agnostic)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub due_at: Option<DateTime<Utc>>,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEventRecord {
    pub id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: String,
    pub subject: String,
    pub from: String,
    pub received_at: DateTime<Utc>,
}

/// Tagged union over the built-in synced record shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "data_type", content = "records")]
pub enum SyncedPayload {
    #[serde(rename = "tasks")]
    Tasks(Vec<TaskRecord>),
    #[serde(rename = "contacts")]
    Contacts(Vec<ContactRecord>),
    #[serde(rename = "calendar")]
    Calendar(Vec<CalendarEventRecord>),
    #[serde(rename = "emails")]
    Emails(Vec<EmailRecord>),
}

impl SyncedPayload {
    /// Shape an opaque cached value into the per-service response type.
    /// Returns None when the payload does not match the declared data type.
    pub fn shape(data_type: &DataType, value: serde_json::Value) -> Option<SyncedPayload> {
        match data_type {
            DataType::Tasks => serde_json::from_value(value).ok().map(SyncedPayload::Tasks),
            DataType::Contacts => serde_json::from_value(value)
                .ok()
                .map(SyncedPayload::Contacts),
            DataType::Calendar => serde_json::from_value(value)
                .ok()
                .map(SyncedPayload::Calendar),
            DataType::Emails => serde_json::from_value(value)
                .ok()
                .map(SyncedPayload::Emails),
            DataType::Custom(_) => None,
        }
    }
}

// ============================================================================
// API Request/Response Types
// ============================================================================

/// What a channel adapter supplies on admit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmitRequest {
    pub user_id: UserId,
    pub channel: Channel,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub concepts: Vec<ConceptHit>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub salience: Option<Salience>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouchRequest {
    pub user_id: UserId,
    pub message_id: MessageId,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub user_id: UserId,
    pub data_type: DataType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub data: serde_json::Value,
    pub outcome: FetchOutcome,
    pub stale: bool,
}
