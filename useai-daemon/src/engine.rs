//! Session engine (component C): owns the live session's state, the
//! parent/child nesting stack, and appends to the chain.
//!
//! Grounded on `procedure_engine.rs`'s shape — a struct owning mutable
//! engine state with methods that mutate it and return a result — and
//! `state.rs`'s plain-data snapshot style, generalized from a single flat
//! race state into the parent/child snapshot stack spec.md §9 calls for: "a
//! stack of snapshots, not a graph" — each nested `start()` pushes the
//! current `LiveSession` by value into `parent_stack`, never a shared
//! pointer into live state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};
use useai_types::{
    BackupBlob, ChainRecord, EndParams, EndResult, EvaluationFramework, EvaluationInput,
    HeartbeatResult, Milestone, MilestoneCategory, MilestoneComplexity, PersistentConfig,
    RecordType, SessionSeal, StartParams, StartResult, TaskOutcome, GENESIS_HASH,
};

use crate::chain;
use crate::error::{EngineError, EngineResult};
use crate::keystore::Keystore;
use crate::paths::Paths;
use crate::stores;

/// The live session's in-memory state (spec §3, "Session state").
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub session_id: String,
    pub conversation_id: String,
    pub conversation_index: u32,
    pub client_name: String,
    pub task_type: useai_types::TaskType,
    pub title: Option<String>,
    pub private_title: Option<String>,
    pub prompt_word_count: Option<u32>,
    pub prompt_image_descriptions: Vec<String>,
    pub model_id: Option<String>,
    pub project: Option<String>,
    pub session_start_time: DateTime<Utc>,
    pub last_activity_time: DateTime<Utc>,
    pub heartbeat_count: u32,
    pub record_count: u32,
    /// Hash of the `session_start` record — the seal's `chain_start_hash`.
    pub session_start_hash: String,
    pub chain_tip_hash: String,
    pub child_paused_ms: i64,
}

/// A snapshot pushed when a nested session starts, restored when the child
/// ends. Holds the parent's state by value plus the moment it was paused, so
/// the parent's active duration can exclude time spent in the child.
#[derive(Debug, Clone)]
struct ParentFrame {
    snapshot: LiveSession,
    paused_at: DateTime<Utc>,
}

/// What the engine remembers about the last session once it has gone idle,
/// so a subsequent `start()` can apply the conversation-id rule and preserve
/// `client_name` across a reset.
#[derive(Debug, Clone)]
struct IdleMemory {
    conversation_id: String,
    conversation_index: u32,
    client_name: String,
}

pub struct SessionEngine {
    paths: Paths,
    keystore: Arc<Keystore>,
    state: Option<LiveSession>,
    parent_stack: Vec<ParentFrame>,
    idle_memory: Option<IdleMemory>,
}

fn duration_seconds(start: DateTime<Utc>, end: DateTime<Utc>, paused_ms: i64) -> f64 {
    let elapsed_ms = (end - start).num_milliseconds() - paused_ms;
    (elapsed_ms as f64 / 1000.0).max(0.0)
}

impl SessionEngine {
    pub fn new(paths: Paths, keystore: Arc<Keystore>) -> Self {
        Self {
            paths,
            keystore,
            state: None,
            parent_stack: Vec::new(),
            idle_memory: None,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.state.is_some()
    }

    fn signing_key(&self) -> Option<&crate::keystore::SigningKey> {
        self.keystore.signing_key.as_ref()
    }

    async fn config(&self) -> PersistentConfig {
        stores::load_config(&self.paths.config_json()).await
    }

    /// Resolves the effective `(conversation_id, conversation_index)` for a
    /// new session given the "currently tracked" conversation (the live
    /// session's, if one is active, else the last sealed one).
    ///
    /// Open question resolved: the rule in spec §4.C ("if a caller passes a
    /// conversation_id matching the currently tracked one ... reuse it and
    /// bump conversation_index; else start a new conversation") applies
    /// uniformly to both the idle-reset case and a nested child's start —
    /// the spec's "(even after reset)" phrasing and "keep or assign
    /// conversation_id (see below)" for the nested case both point at this
    /// one rule.
    fn resolve_conversation(
        tracked: Option<(&str, u32)>,
        requested: Option<&str>,
    ) -> (String, u32) {
        match (tracked, requested) {
            (Some((tracked_id, tracked_index)), Some(req)) if req == tracked_id => {
                (tracked_id.to_string(), tracked_index + 1)
            }
            (_, Some(req)) => (req.to_string(), 0),
            (_, None) => (format!("conv-{}", uuid::Uuid::new_v4().simple()), 0),
        }
    }

    pub async fn start(&mut self, params: StartParams) -> EngineResult<StartResult> {
        let task_type = params.task_type;
        let now = Utc::now();

        if let Some(current) = self.state.take() {
            // Nested start: push the parent's state and begin the child.
            let tracked = (current.conversation_id.as_str(), current.conversation_index);
            let (conversation_id, conversation_index) =
                Self::resolve_conversation(Some(tracked), params.conversation_id.as_deref());
            let client_name = params.client.unwrap_or_else(|| current.client_name.clone());

            self.parent_stack.push(ParentFrame {
                snapshot: current,
                paused_at: now,
            });

            let session_id = format!("sess-{}", uuid::Uuid::new_v4().simple());
            let mut new_state = LiveSession {
                session_id: session_id.clone(),
                conversation_id: conversation_id.clone(),
                conversation_index,
                client_name,
                task_type,
                title: params.title,
                private_title: params.private_title,
                prompt_word_count: params.prompt_word_count,
                prompt_image_descriptions: params.prompt_image_descriptions,
                model_id: params.model,
                project: params.project,
                session_start_time: now,
                last_activity_time: now,
                heartbeat_count: 0,
                record_count: 0,
                session_start_hash: GENESIS_HASH.to_string(),
                chain_tip_hash: GENESIS_HASH.to_string(),
                child_paused_ms: 0,
            };

            let start_hash = self.append_start_record(&new_state).await?;
            new_state.session_start_hash = start_hash.clone();
            new_state.chain_tip_hash = start_hash;
            self.state = Some(new_state);

            info!(session_id = %session_id, parent_depth = self.parent_stack.len(), "nested session started");
            return Ok(StartResult {
                session_id,
                conversation_id,
            });
        }

        // No active session: reset from idle memory (if any) or start fresh.
        let tracked = self
            .idle_memory
            .as_ref()
            .map(|m| (m.conversation_id.as_str(), m.conversation_index));
        let (conversation_id, conversation_index) =
            Self::resolve_conversation(tracked, params.conversation_id.as_deref());
        let client_name = params.client.unwrap_or_else(|| {
            self.idle_memory
                .as_ref()
                .map(|m| m.client_name.clone())
                .unwrap_or_default()
        });

        let session_id = format!("sess-{}", uuid::Uuid::new_v4().simple());
        let mut new_state = LiveSession {
            session_id: session_id.clone(),
            conversation_id: conversation_id.clone(),
            conversation_index,
            client_name,
            task_type,
            title: params.title,
            private_title: params.private_title,
            prompt_word_count: params.prompt_word_count,
            prompt_image_descriptions: params.prompt_image_descriptions,
            model_id: params.model,
            project: params.project,
            session_start_time: now,
            last_activity_time: now,
            heartbeat_count: 0,
            record_count: 0,
            session_start_hash: GENESIS_HASH.to_string(),
            chain_tip_hash: GENESIS_HASH.to_string(),
            child_paused_ms: 0,
        };

        let start_hash = self.append_start_record(&new_state).await?;
        new_state.session_start_hash = start_hash.clone();
        new_state.chain_tip_hash = start_hash;
        self.state = Some(new_state);
        self.idle_memory = None;

        info!(session_id = %session_id, %conversation_id, "session started");
        Ok(StartResult {
            session_id,
            conversation_id,
        })
    }

    /// Appends the `session_start` record and returns its hash, which becomes
    /// both the live tip and the seal's `chain_start_hash`.
    async fn append_start_record(&self, state: &LiveSession) -> EngineResult<String> {
        let mut data = serde_json::Map::new();
        data.insert("task_type".to_string(), json!(state.task_type));
        data.insert("client".to_string(), json!(state.client_name));
        if let Some(title) = &state.title {
            data.insert("title".to_string(), json!(title));
        }
        if let Some(model) = &state.model_id {
            data.insert("model".to_string(), json!(model));
        }
        if let Some(project) = &state.project {
            data.insert("project".to_string(), json!(project));
        }
        data.insert(
            "conversation_index".to_string(),
            json!(state.conversation_index),
        );

        let record = chain::build_chain_record(
            RecordType::SessionStart,
            &state.session_id,
            data,
            &state.chain_tip_hash,
            self.signing_key(),
        );
        let hash = record.hash.clone();
        self.append_record(&state.session_id, record).await?;
        Ok(hash)
    }

    async fn append_record(&self, session_id: &str, record: ChainRecord) -> EngineResult<()> {
        let path = self.paths.active_chain(session_id);
        stores::append_chain_record(&path, &record)
            .await
            .map_err(EngineError::Io)
    }

    pub async fn heartbeat(&mut self) -> EngineResult<HeartbeatResult> {
        let now = Utc::now();
        let state = self.state.as_ref().ok_or(EngineError::NoActiveSession)?;

        let heartbeat_number = state.heartbeat_count + 1;
        let session_id = state.session_id.clone();
        let prev_hash = state.chain_tip_hash.clone();
        let start_time = state.session_start_time;
        let paused_ms = state.child_paused_ms;

        let mut data = serde_json::Map::new();
        data.insert("heartbeat_number".to_string(), json!(heartbeat_number));

        let record = chain::build_chain_record(
            RecordType::Heartbeat,
            &session_id,
            data,
            &prev_hash,
            self.signing_key(),
        );
        let new_hash = record.hash.clone();

        // Mutate counters only after the append succeeds: on `IO_ERROR` the
        // state is untouched, so a retried heartbeat doesn't double-count
        // (spec §4.C failure semantics, and record_count == line count).
        self.append_record(&session_id, record).await?;

        let state = self.state.as_mut().unwrap();
        state.last_activity_time = now;
        state.heartbeat_count = heartbeat_number;
        state.record_count += 1;
        state.chain_tip_hash = new_hash;

        let cumulative_seconds = duration_seconds(start_time, now, paused_ms);
        Ok(HeartbeatResult {
            heartbeat_number,
            cumulative_seconds,
        })
    }

    pub async fn end(&mut self, params: EndParams) -> EngineResult<EndResult> {
        self.end_at(params, Utc::now()).await
    }

    /// Shared by `end()` (real end time) and `seal_active()` (the last known
    /// activity timestamp, since nothing observed the session actually
    /// ending).
    async fn end_at(&mut self, params: EndParams, now: DateTime<Utc>) -> EngineResult<EndResult> {
        let state = self.state.as_ref().ok_or(EngineError::NoActiveSession)?.clone();
        let config = self.config().await;

        let session_duration = duration_seconds(state.session_start_time, now, state.child_paused_ms);
        let active_duration =
            duration_seconds(state.session_start_time, state.last_activity_time, state.child_paused_ms);

        let score = params.evaluation.map(|e| compute_score(&e, config.evaluation_framework));

        // session_end record
        let mut end_data = serde_json::Map::new();
        end_data.insert("duration_seconds".to_string(), json!(session_duration));
        end_data.insert("files_touched_count".to_string(), json!(params.files_touched_count));
        end_data.insert("languages".to_string(), json!(params.languages));
        end_data.insert("heartbeat_count".to_string(), json!(state.heartbeat_count));
        if let Some(evaluation) = &params.evaluation {
            end_data.insert("evaluation".to_string(), json!(evaluation));
        }
        let end_record = chain::build_chain_record(
            RecordType::SessionEnd,
            &state.session_id,
            end_data,
            &state.chain_tip_hash,
            self.signing_key(),
        );
        let mut tip_hash = end_record.hash.clone();
        self.append_record(&state.session_id, end_record).await?;

        // Milestones, gated on config.milestone_tracking (authoritative at
        // end time per spec §9's resolved open question).
        let mut milestone_count = 0u32;
        if config.milestone_tracking {
            for input in &params.milestones {
                let mut data = serde_json::Map::new();
                data.insert("title".to_string(), json!(input.title));
                data.insert("category".to_string(), json!(input.category));
                data.insert("complexity".to_string(), json!(input.complexity));

                let record = chain::build_chain_record(
                    RecordType::Milestone,
                    &state.session_id,
                    data,
                    &tip_hash,
                    self.signing_key(),
                );
                tip_hash = record.hash.clone();
                let chain_hash = record.hash.clone();
                self.append_record(&state.session_id, record).await?;

                let milestone = Milestone {
                    id: format!("ms-{}", uuid::Uuid::new_v4().simple()),
                    session_id: state.session_id.clone(),
                    title: input.title.clone(),
                    private_title: input.private_title.clone(),
                    category: input.category,
                    complexity: input.complexity,
                    duration_minutes: session_duration / 60.0,
                    languages: params.languages.clone(),
                    client: state.client_name.clone(),
                    created_at: now,
                    chain_hash,
                    published: false,
                };
                stores::upsert_milestone(&self.paths.milestones_json(), milestone)
                    .await
                    .map_err(EngineError::Io)?;
                milestone_count += 1;
            }
        }

        // Seal: signs (chain_start_hash, chain_end_hash).
        let chain_start_hash = state.session_start_hash.clone();
        let seal_signature = self.sign_seal(&chain_start_hash, &tip_hash);

        let mut seal_data = serde_json::Map::new();
        seal_data.insert("chain_start_hash".to_string(), json!(chain_start_hash));
        seal_data.insert("chain_end_hash".to_string(), json!(tip_hash));
        seal_data.insert("seal_signature".to_string(), json!(seal_signature));
        let seal_record = chain::build_chain_record(
            RecordType::SessionSeal,
            &state.session_id,
            seal_data,
            &tip_hash,
            self.signing_key(),
        );
        let chain_end_hash = seal_record.hash.clone();
        self.append_record(&state.session_id, seal_record).await?;

        let record_count = state.record_count + 2 /* start + end */ + 1 /* seal */ + milestone_count;

        // Move ACTIVE/<id>.jsonl -> SEALED/<id>.jsonl atomically.
        stores::seal_chain_file(
            &self.paths.active_chain(&state.session_id),
            &self.paths.sealed_chain(&state.session_id),
        )
        .await
        .map_err(EngineError::Io)?;

        let seal = SessionSeal {
            session_id: state.session_id.clone(),
            conversation_id: state.conversation_id.clone(),
            conversation_index: state.conversation_index,
            client_name: state.client_name.clone(),
            task_type: params.task_type,
            title: state.title.clone(),
            parent_session_id: self.parent_stack.last().map(|f| f.snapshot.session_id.clone()),
            started_at: state.session_start_time,
            ended_at: now,
            duration_seconds: session_duration,
            active_duration_seconds: active_duration,
            heartbeat_count: state.heartbeat_count,
            record_count,
            files_touched_count: params.files_touched_count,
            languages: params.languages,
            milestone_count,
            chain_start_hash,
            chain_end_hash,
            seal_signature,
            evaluation: params.evaluation,
            score,
        };
        stores::append_session(&self.paths.sessions_json(), seal)
            .await
            .map_err(EngineError::Io)?;

        // Pop the parent frame, if any; else go idle.
        if let Some(frame) = self.parent_stack.pop() {
            let paused_ms = (now - frame.paused_at).num_milliseconds().max(0);
            let mut restored = frame.snapshot;
            restored.child_paused_ms += paused_ms;
            self.state = Some(restored);
        } else {
            self.idle_memory = Some(IdleMemory {
                conversation_id: state.conversation_id.clone(),
                conversation_index: state.conversation_index,
                client_name: state.client_name.clone(),
            });
            self.state = None;
        }

        info!(session_id = %state.session_id, duration_seconds = session_duration, "session sealed");
        Ok(EndResult {
            duration_seconds: session_duration,
            milestone_count,
            score,
        })
    }

    fn sign_seal(&self, chain_start_hash: &str, chain_end_hash: &str) -> String {
        let pair_hash = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(chain_start_hash.as_bytes());
            hasher.update(chain_end_hash.as_bytes());
            hex::encode(hasher.finalize())
        };
        chain::sign_hash(&pair_hash, self.signing_key())
    }

    /// Safety net: if a session is in progress but no `end` call arrived
    /// (the owning process exited), synthesize an end+seal using the last
    /// known timestamps. A no-op in `IDLE` and idempotent once sealed.
    pub async fn seal_active(&mut self) -> EngineResult<Option<EndResult>> {
        let Some(state) = self.state.as_ref() else {
            return Ok(None);
        };
        let synthetic = EndParams {
            task_type: state.task_type,
            languages: Vec::new(),
            files_touched_count: 0,
            milestones: Vec::new(),
            evaluation: None,
        };
        // Use the last known activity time, not "now": nothing observed this
        // session actually ending, so `now` would bill the downtime between
        // the crash and this call as active session duration (spec §4.C).
        let last_known = state.last_activity_time;
        let result = self.end_at(synthetic, last_known).await?;
        warn!("synthesized session_end + session_seal via seal_active");
        Ok(Some(result))
    }

    /// Scans `data/active/` for chain files left by a process that died
    /// without calling `end`, and seals each via the same synthetic path as
    /// `seal_active`. Used on daemon startup.
    pub async fn recover_abandoned_sessions(&mut self) -> EngineResult<u32> {
        let active_dir = self.paths.active_dir();
        let mut recovered = 0u32;
        let mut read_dir = match tokio::fs::read_dir(&active_dir).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(EngineError::Io(e)),
        };

        while let Some(entry) = read_dir.next_entry().await.map_err(EngineError::Io)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let session_id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s.to_string(),
                None => continue,
            };
            let records = stores::read_chain_records(&path).await.map_err(EngineError::Io)?;
            if records.is_empty() {
                continue;
            }
            if records
                .iter()
                .any(|r| r.record_type == RecordType::SessionSeal)
            {
                continue; // already sealed, stray file
            }

            let last = records.last().unwrap();
            let first = records.first().unwrap();
            let heartbeat_count = records
                .iter()
                .filter(|r| r.record_type == RecordType::Heartbeat)
                .count() as u32;
            self.state = Some(LiveSession {
                session_id: session_id.clone(),
                conversation_id: session_id.clone(),
                conversation_index: 0,
                client_name: "unknown".to_string(),
                task_type: useai_types::TaskType::Other,
                title: None,
                private_title: None,
                prompt_word_count: None,
                prompt_image_descriptions: Vec::new(),
                model_id: None,
                project: None,
                session_start_time: first.timestamp,
                last_activity_time: last.timestamp,
                heartbeat_count,
                // `end()` adds start+end+seal+milestones on top of this; the
                // start record already on disk must not be double-counted.
                record_count: heartbeat_count,
                session_start_hash: first.hash.clone(),
                chain_tip_hash: last.hash.clone(),
                child_paused_ms: 0,
            });
            self.seal_active().await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    pub async fn backup(&self) -> EngineResult<BackupBlob> {
        let config = self.config().await;
        let sessions = stores::load_sessions(&self.paths.sessions_json()).await;
        let milestones = stores::load_milestones(&self.paths.milestones_json()).await;

        let mut sealed_chains = HashMap::new();
        let sealed_dir = self.paths.sealed_dir();
        if let Ok(mut read_dir) = tokio::fs::read_dir(&sealed_dir).await {
            while let Some(entry) = read_dir.next_entry().await.map_err(EngineError::Io)? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                    if let Ok(contents) = tokio::fs::read_to_string(&path).await {
                        let filename = path
                            .file_name()
                            .and_then(|n| n.to_str())
                            .unwrap_or_default()
                            .to_string();
                        sealed_chains.insert(filename, contents);
                    }
                }
            }
        }

        Ok(BackupBlob {
            version: 1,
            exported_at: Utc::now(),
            config,
            sessions,
            milestones,
            sealed_chains,
        })
    }

    /// Merges a backup blob into the local stores. Duplicates (same
    /// `session_id` for seals, same `id` for milestones) are skipped. Never
    /// touches `data/active/`.
    pub async fn restore(&self, blob: BackupBlob) -> EngineResult<()> {
        let mut sessions = stores::load_sessions(&self.paths.sessions_json()).await;
        let existing_ids: std::collections::HashSet<_> =
            sessions.iter().map(|s| s.session_id.clone()).collect();
        for seal in blob.sessions {
            if !existing_ids.contains(&seal.session_id) {
                sessions.push(seal);
            }
        }
        stores::write_atomic(
            &self.paths.sessions_json(),
            &serde_json::to_vec_pretty(&sessions).expect("sessions always serialize"),
        )
        .await
        .map_err(EngineError::Io)?;

        let mut milestones = stores::load_milestones(&self.paths.milestones_json()).await;
        let existing_ms_ids: std::collections::HashSet<_> =
            milestones.iter().map(|m| m.id.clone()).collect();
        for milestone in blob.milestones {
            if !existing_ms_ids.contains(&milestone.id) {
                milestones.push(milestone);
            }
        }
        stores::write_atomic(
            &self.paths.milestones_json(),
            &serde_json::to_vec_pretty(&milestones).expect("milestones always serialize"),
        )
        .await
        .map_err(EngineError::Io)?;

        for (filename, contents) in blob.sealed_chains {
            let path = self.paths.sealed_dir().join(filename);
            if tokio::fs::metadata(&path).await.is_ok() {
                continue; // duplicate chain file, skip
            }
            stores::write_atomic(&path, contents.as_bytes())
                .await
                .map_err(EngineError::Io)?;
        }

        Ok(())
    }
}

/// Raw-framework score: `round(20*(0.25*pq + 0.25*cp + 0.20*sq + 0.20*il +
/// 0.10*min(tl,5)))`, then scaled by the task-outcome multiplier if the
/// outcome isn't `completed`, then clamped to [0,100].
///
/// The "space" framework is reserved (spec §4.C, §9's resolved open
/// question) and falls back to this same formula.
fn compute_score(evaluation: &EvaluationInput, _framework: EvaluationFramework) -> u32 {
    let tools_leveraged = (evaluation.tools_leveraged as f64).min(5.0);
    let raw = 20.0
        * (0.25 * evaluation.prompt_quality as f64
            + 0.25 * evaluation.context_provided as f64
            + 0.20 * evaluation.scope_quality as f64
            + 0.20 * evaluation.independence_level as f64
            + 0.10 * tools_leveraged);

    let scaled = raw * evaluation.task_outcome.score_multiplier();
    scaled.round().clamp(0.0, 100.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use useai_types::TaskType;

    fn paths(dir: &tempfile::TempDir) -> Paths {
        Paths::from_base(dir.path())
    }

    fn start_params(task_type: TaskType) -> StartParams {
        StartParams {
            task_type,
            client: Some("claude-code".to_string()),
            title: None,
            private_title: None,
            prompt: None,
            prompt_word_count: None,
            prompt_image_descriptions: Vec::new(),
            model: None,
            project: None,
            conversation_id: None,
        }
    }

    fn end_params() -> EndParams {
        EndParams {
            task_type: TaskType::Coding,
            languages: vec!["typescript".to_string()],
            files_touched_count: 3,
            milestones: Vec::new(),
            evaluation: None,
        }
    }

    #[tokio::test]
    async fn minimal_lifecycle_produces_four_records_and_one_seal() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = SessionEngine::new(paths(&dir), Arc::new(Keystore::unsigned()));

        let start = engine.start(start_params(TaskType::Coding)).await.unwrap();
        engine.heartbeat().await.unwrap();
        let end = engine.end(end_params()).await.unwrap();

        assert!(end.duration_seconds >= 0.0);
        assert_eq!(end.milestone_count, 0);

        let sealed_path = paths(&dir).sealed_chain(&start.session_id);
        let records = stores::read_chain_records(&sealed_path).await.unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].record_type, RecordType::SessionStart);
        assert_eq!(records[1].record_type, RecordType::Heartbeat);
        assert_eq!(records[2].record_type, RecordType::SessionEnd);
        assert_eq!(records[3].record_type, RecordType::SessionSeal);

        let sessions = stores::load_sessions(&paths(&dir).sessions_json()).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].record_count, 4);
    }

    #[tokio::test]
    async fn milestone_tracking_disabled_skips_milestone_record() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(&dir);
        tokio::fs::create_dir_all(p.base()).await.unwrap();
        stores::save_config(
            &p.config_json(),
            &PersistentConfig {
                milestone_tracking: false,
                ..PersistentConfig::default()
            },
        )
        .await
        .unwrap();

        let mut engine = SessionEngine::new(p.clone(), Arc::new(Keystore::unsigned()));
        let start = engine.start(start_params(TaskType::Coding)).await.unwrap();
        let mut params = end_params();
        params.milestones.push(useai_types::MilestoneInput {
            title: "X".to_string(),
            private_title: None,
            category: MilestoneCategory::Feature,
            complexity: MilestoneComplexity::Simple,
        });
        let end = engine.end(params).await.unwrap();
        assert_eq!(end.milestone_count, 0);

        let milestones = stores::load_milestones(&p.milestones_json()).await;
        assert!(milestones.is_empty());

        let sealed_path = p.sealed_chain(&start.session_id);
        let records = stores::read_chain_records(&sealed_path).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(!records.iter().any(|r| r.record_type == RecordType::Milestone));
    }

    #[tokio::test]
    async fn nested_child_excludes_paused_time_from_parent_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = SessionEngine::new(paths(&dir), Arc::new(Keystore::unsigned()));

        let parent = engine.start(start_params(TaskType::Coding)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let child = engine.start(start_params(TaskType::Debugging)).await.unwrap();
        assert_ne!(parent.session_id, child.session_id);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let child_end = engine.end(end_params()).await.unwrap();

        // Parent resumes, active again immediately.
        assert!(engine.is_in_progress());
        let parent_end = engine.end(end_params()).await.unwrap();

        assert!(child_end.duration_seconds >= 0.0);
        assert!(parent_end.duration_seconds >= 0.0);

        let p = paths(&dir);
        let sessions = stores::load_sessions(&p.sessions_json()).await;
        assert_eq!(sessions.len(), 2);
        let parent_seal = sessions.iter().find(|s| s.session_id == parent.session_id).unwrap();
        // Parent's seal should be present and its parent_session_id empty.
        assert!(parent_seal.parent_session_id.is_none());
        let child_seal = sessions.iter().find(|s| s.session_id == child.session_id).unwrap();
        assert_eq!(child_seal.parent_session_id.as_deref(), Some(parent.session_id.as_str()));
    }

    #[tokio::test]
    async fn heartbeat_without_active_session_is_no_active_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = SessionEngine::new(paths(&dir), Arc::new(Keystore::unsigned()));
        let err = engine.heartbeat().await.unwrap_err();
        assert!(matches!(err, EngineError::NoActiveSession));
    }

    #[tokio::test]
    async fn seal_active_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = SessionEngine::new(paths(&dir), Arc::new(Keystore::unsigned()));
        let start = engine.start(start_params(TaskType::Coding)).await.unwrap();

        let first = engine.seal_active().await.unwrap();
        assert!(first.is_some());
        let second = engine.seal_active().await.unwrap();
        assert!(second.is_none());

        let p = paths(&dir);
        assert!(tokio::fs::metadata(p.sealed_chain(&start.session_id)).await.is_ok());
        assert!(tokio::fs::metadata(p.active_chain(&start.session_id)).await.is_err());
    }

    #[tokio::test]
    async fn recover_abandoned_sessions_seals_orphaned_chain_files() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(&dir);

        // Simulate a process that started a session, sent one heartbeat, and
        // then crashed without ever calling `end` — no AppState/engine
        // instance survives, only the active chain file on disk.
        let orphaned_session_id = {
            let mut crashed = SessionEngine::new(p.clone(), Arc::new(Keystore::unsigned()));
            let start = crashed.start(start_params(TaskType::Coding)).await.unwrap();
            crashed.heartbeat().await.unwrap();
            start.session_id
        };
        assert!(tokio::fs::metadata(p.active_chain(&orphaned_session_id)).await.is_ok());

        // Back-date the heartbeat's timestamp by 3 hours, simulating a crash
        // discovered long after the last observed activity: a synthesized
        // seal must report the downtime-free duration up to that timestamp,
        // not `now - start` (spec §4.C, E4).
        let active_path = p.active_chain(&orphaned_session_id);
        let raw = tokio::fs::read_to_string(&active_path).await.unwrap();
        let back_dated_last_activity = Utc::now() - chrono::Duration::hours(3);
        let patched: String = raw
            .lines()
            .map(|line| {
                let mut value: serde_json::Value = serde_json::from_str(line).unwrap();
                if value["type"] == json!("heartbeat") {
                    value["timestamp"] = json!(back_dated_last_activity.to_rfc3339());
                }
                value.to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
            + "\n";
        tokio::fs::write(&active_path, patched).await.unwrap();

        // Daemon restarts with a fresh, idle engine.
        let mut engine = SessionEngine::new(p.clone(), Arc::new(Keystore::unsigned()));
        assert!(!engine.is_in_progress());
        let recovered = engine.recover_abandoned_sessions().await.unwrap();
        assert_eq!(recovered, 1);
        assert!(!engine.is_in_progress());

        assert!(tokio::fs::metadata(p.active_chain(&orphaned_session_id)).await.is_err());
        let sealed_path = p.sealed_chain(&orphaned_session_id);
        let records = stores::read_chain_records(&sealed_path).await.unwrap();
        // start + heartbeat + synthesized end + seal.
        assert_eq!(records.len(), 4);
        assert_eq!(records.last().unwrap().record_type, RecordType::SessionSeal);

        let sessions = stores::load_sessions(&p.sessions_json()).await;
        let seal = sessions.iter().find(|s| s.session_id == orphaned_session_id).unwrap();
        assert_eq!(seal.record_count, 4);
        assert_eq!(seal.heartbeat_count, 1);
        // ~3 hours, not the sub-second real time since the session started:
        // proves the synthesized end used the last known timestamp, not `now`.
        assert!(seal.duration_seconds > 3600.0 * 2.9 && seal.duration_seconds < 3600.0 * 3.1);

        // A second recovery pass finds nothing left to do.
        let recovered_again = engine.recover_abandoned_sessions().await.unwrap();
        assert_eq!(recovered_again, 0);
    }

    #[tokio::test]
    async fn restore_after_backup_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(&dir);
        let mut engine = SessionEngine::new(p.clone(), Arc::new(Keystore::unsigned()));
        engine.start(start_params(TaskType::Coding)).await.unwrap();
        engine.end(end_params()).await.unwrap();

        let blob = engine.backup().await.unwrap();
        let before = stores::load_sessions(&p.sessions_json()).await;

        engine.restore(blob).await.unwrap();
        let after = stores::load_sessions(&p.sessions_json()).await;

        assert_eq!(before.len(), after.len());
    }

    #[test]
    fn raw_score_formula_matches_spec() {
        let evaluation = EvaluationInput {
            prompt_quality: 5,
            context_provided: 5,
            scope_quality: 5,
            independence_level: 5,
            tools_leveraged: 5,
            task_outcome: TaskOutcome::Completed,
        };
        // 20 * (0.25*5+0.25*5+0.2*5+0.2*5+0.1*5) = 20*5 = 100
        assert_eq!(compute_score(&evaluation, EvaluationFramework::Raw), 100);
    }

    #[test]
    fn raw_score_scales_by_outcome_multiplier() {
        let evaluation = EvaluationInput {
            prompt_quality: 5,
            context_provided: 5,
            scope_quality: 5,
            independence_level: 5,
            tools_leveraged: 5,
            task_outcome: TaskOutcome::Blocked,
        };
        assert_eq!(compute_score(&evaluation, EvaluationFramework::Raw), 50);
    }

    #[test]
    fn raw_score_caps_tools_leveraged_at_five() {
        let evaluation = EvaluationInput {
            prompt_quality: 1,
            context_provided: 1,
            scope_quality: 1,
            independence_level: 1,
            tools_leveraged: 200, // u8 max well above 5, must clamp
            task_outcome: TaskOutcome::Completed,
        };
        let capped = EvaluationInput {
            tools_leveraged: 5,
            ..evaluation
        };
        assert_eq!(
            compute_score(&evaluation, EvaluationFramework::Raw),
            compute_score(&capped, EvaluationFramework::Raw)
        );
    }
}
