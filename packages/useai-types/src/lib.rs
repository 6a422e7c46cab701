//! # useai-types
//!
//! Shared wire and data-model structures for the useai session engine.
//!
//! These types are used by:
//! - `useai-daemon`: building, persisting and serving chain records, seals,
//!   milestones and config.
//! - Any external consumer (CLI front end, read-only dashboard API, AI-tool
//!   config writers) that talks to the daemon over `/mcp` or reads its
//!   on-disk stores directly.
//!
//! This crate never carries prompt text, model output, or source code — only
//! the metadata described in the data model (durations, tool names,
//! languages, task types, user-supplied titles, self-evaluation scores).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Chain records ─────────────────────────────────────────────────────────────

/// The hash the genesis record of every chain file chains from.
pub const GENESIS_HASH: &str = "GENESIS";

/// The signature value used when no keystore is available.
pub const UNSIGNED: &str = "unsigned";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    SessionStart,
    Heartbeat,
    SessionEnd,
    SessionSeal,
    Milestone,
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// The atomic unit persisted to a per-session `.jsonl` chain file.
///
/// `data` is an open mapping: unknown keys must be preserved on read-back so
/// the hash — computed over whatever keys were present at write time — never
/// needs re-deriving from a re-serialized value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub prev_hash: String,
    pub hash: String,
    pub signature: String,
}

/// The five fields whose canonical JSON is hashed to produce `hash`.
/// Field order is load-bearing: `id,type,session_id,timestamp,data`.
#[derive(Debug, Clone, Serialize)]
pub struct ChainRecordCore<'a> {
    pub id: &'a str,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub session_id: &'a str,
    pub timestamp: DateTime<Utc>,
    pub data: &'a serde_json::Map<String, serde_json::Value>,
}

// ── Seals ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSeal {
    pub session_id: String,
    pub conversation_id: String,
    pub conversation_index: u32,
    pub client_name: String,
    pub task_type: TaskType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub active_duration_seconds: f64,
    pub heartbeat_count: u32,
    pub record_count: u32,
    pub files_touched_count: u32,
    pub languages: Vec<String>,
    pub milestone_count: u32,
    pub chain_start_hash: String,
    pub chain_end_hash: String,
    pub seal_signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
}

// ── Milestones ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneCategory {
    Feature,
    Bugfix,
    Refactor,
    Test,
    Docs,
    Setup,
    Deployment,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneComplexity {
    Simple,
    Medium,
    Complex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub session_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_title: Option<String>,
    pub category: MilestoneCategory,
    pub complexity: MilestoneComplexity,
    pub duration_minutes: f64,
    pub languages: Vec<String>,
    pub client: String,
    pub created_at: DateTime<Utc>,
    pub chain_hash: String,
    pub published: bool,
}

/// A milestone as supplied by the caller to `end`, before the engine fills in
/// identifiers and chain linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MilestoneInput {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_title: Option<String>,
    #[serde(default = "default_milestone_category")]
    pub category: MilestoneCategory,
    #[serde(default = "default_milestone_complexity")]
    pub complexity: MilestoneComplexity,
}

fn default_milestone_category() -> MilestoneCategory {
    MilestoneCategory::Other
}

fn default_milestone_complexity() -> MilestoneComplexity {
    MilestoneComplexity::Medium
}

// ── Task type ──────────────────────────────────────────────────────────────────

/// The closed set of recognized task-type tags. `start` fails with
/// `INVALID_ARGUMENT` for anything outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Coding,
    Debugging,
    Refactoring,
    Review,
    Planning,
    Research,
    Documentation,
    Testing,
    Other,
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::Coding
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

impl std::str::FromStr for TaskType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|_| ())
    }
}

// ── Evaluation / scoring ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Partial,
    Blocked,
    Abandoned,
}

impl TaskOutcome {
    /// Multiplier applied to the raw-framework score before clamping.
    pub fn score_multiplier(self) -> f64 {
        match self {
            TaskOutcome::Completed => 1.0,
            TaskOutcome::Partial => 0.75,
            TaskOutcome::Blocked => 0.5,
            TaskOutcome::Abandoned => 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationFramework {
    Raw,
    Space,
}

impl Default for EvaluationFramework {
    fn default() -> Self {
        EvaluationFramework::Raw
    }
}

/// Self-evaluation inputs supplied at `end` time. Each rated field is 1–5.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluationInput {
    pub prompt_quality: u8,
    pub context_provided: u8,
    pub scope_quality: u8,
    pub independence_level: u8,
    pub tools_leveraged: u8,
    pub task_outcome: TaskOutcome,
}

// ── Persistent config ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
    pub token: String,
    pub user: AuthUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentConfig {
    #[serde(default = "default_true")]
    pub milestone_tracking: bool,
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_hours: u32,
    #[serde(default)]
    pub evaluation_framework: EvaluationFramework,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auth: Option<AuthInfo>,
}

fn default_true() -> bool {
    true
}

fn default_sync_interval() -> u32 {
    24
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            milestone_tracking: true,
            auto_sync: true,
            sync_interval_hours: 24,
            evaluation_framework: EvaluationFramework::Raw,
            last_sync_at: None,
            auth: None,
        }
    }
}

// ── Keystore ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreFile {
    pub public_key_pem: String,
    pub encrypted_private_key: String,
    pub iv: String,
    pub tag: String,
    pub salt: String,
    pub created_at: DateTime<Utc>,
}

// ── PID file ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidFileInfo {
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

// ── Backup / restore ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupBlob {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub config: PersistentConfig,
    pub sessions: Vec<SessionSeal>,
    pub milestones: Vec<Milestone>,
    /// `<session_id>.jsonl` filename -> entire file contents.
    pub sealed_chains: HashMap<String, String>,
}

// ── Tool call catalog ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartParams {
    /// Defaults to `coding` when omitted (spec §4.C).
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub private_title: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub prompt_word_count: Option<u32>,
    #[serde(default)]
    pub prompt_image_descriptions: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResult {
    pub session_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResult {
    pub heartbeat_number: u32,
    pub cumulative_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndParams {
    pub task_type: TaskType,
    pub languages: Vec<String>,
    pub files_touched_count: u32,
    #[serde(default)]
    pub milestones: Vec<MilestoneInput>,
    #[serde(default)]
    pub evaluation: Option<EvaluationInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndResult {
    pub duration_seconds: f64,
    pub milestone_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsBreakdown {
    pub by_client: HashMap<String, f64>,
    pub by_language: HashMap<String, f64>,
    pub by_task_type: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResult {
    pub session_count: u32,
    pub total_duration_seconds: f64,
    pub day_streak: u32,
    pub breakdown: StatsBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub session_count: u32,
    pub unpublished_milestones: u32,
    pub published_milestones: u32,
    pub total_bytes_on_disk: u64,
    pub config: PersistentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMilestonesResult {
    pub milestones: Vec<Milestone>,
}

/// The closed catalog of operations callable over the daemon's transport.
/// Dispatch is by name (the `method` field of the `/mcp` request), not by
/// subclass — see spec.md §9's "tagged variant" design note.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum ToolCall {
    Start(StartParams),
    Heartbeat,
    End(EndParams),
    SealActive,
    Backup,
    Restore(BackupBlob),
    Stats,
    ListMilestones,
    Status,
}

// ── Result envelope ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: Vec<ContentItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolResponse {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: None,
        }
    }

    pub fn ok_json(value: &impl Serialize) -> Self {
        let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string());
        Self {
            content: vec![ContentItem::text(text)],
            is_error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(message)],
            is_error: Some(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_round_trips_through_serde() {
        let json = serde_json::to_string(&TaskType::Coding).unwrap();
        assert_eq!(json, "\"coding\"");
        let back: TaskType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TaskType::Coding);
    }

    #[test]
    fn task_type_from_str_rejects_unknown_tags() {
        use std::str::FromStr;
        assert!(TaskType::from_str("coding").is_ok());
        assert!(TaskType::from_str("not-a-real-tag").is_err());
    }

    #[test]
    fn tool_call_tags_by_method_name() {
        let call = ToolCall::Heartbeat;
        let json = serde_json::to_string(&call).unwrap();
        assert_eq!(json, "{\"method\":\"heartbeat\"}");
    }
}
