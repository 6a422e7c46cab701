//! Tool handlers (component E): map the catalog of externally exposed
//! operations onto `SessionEngine` calls, enforce schemas, and translate
//! `EngineError` into the result envelope.
//!
//! Grounded on `handlers.rs`'s per-event handler functions operating over
//! `SharedState`/`SharedEngine`, generalized from Socket.IO event handlers to
//! the closed `ToolCall` dispatch enum spec §9 calls for ("tagged variant,
//! dispatch by name"). Schema enforcement itself lives in `useai-types`
//! (`#[serde(deny_unknown_fields)]` plus the closed `TaskType` enum); this
//! module's job is purely delegation and error-envelope translation.

use serde::Serialize;
use tracing::error;

use crate::engine::SessionEngine;
use crate::error::EngineError;
use crate::paths::Paths;
use crate::stats;
use useai_types::{ListMilestonesResult, ToolCall, ToolResponse};

/// Per-transport context a handler needs beyond the engine it's dispatched
/// against: the store location, for the pure-read handlers (`stats`,
/// `list_milestones`, `status`).
pub struct HandlerContext<'a> {
    pub paths: &'a Paths,
}

/// Converts an engine result into the handler envelope. `NoActiveSession` is
/// not an error per spec §7 — it's returned as a non-error content message.
fn respond<T: Serialize>(result: Result<T, EngineError>) -> ToolResponse {
    match result {
        Ok(value) => ToolResponse::ok_json(&value),
        Err(EngineError::NoActiveSession) => ToolResponse::ok("No active session to end"),
        Err(e) => {
            error!("tool call failed: {e}");
            ToolResponse::error(e.to_string())
        }
    }
}

pub async fn dispatch(call: ToolCall, engine: &mut SessionEngine, ctx: &HandlerContext<'_>) -> ToolResponse {
    match call {
        ToolCall::Start(params) => respond(engine.start(params).await),
        ToolCall::Heartbeat => respond(engine.heartbeat().await),
        ToolCall::End(params) => respond(engine.end(params).await),
        ToolCall::SealActive => match engine.seal_active().await {
            Ok(Some(result)) => ToolResponse::ok_json(&result),
            Ok(None) => ToolResponse::ok("No active session to seal"),
            Err(e) => {
                error!("seal_active failed: {e}");
                ToolResponse::error(e.to_string())
            }
        },
        ToolCall::Backup => respond(engine.backup().await),
        ToolCall::Restore(blob) => respond(engine.restore(blob).await.map(|_| BackupAck)),
        ToolCall::Stats => {
            let result = stats::compute_stats(ctx.paths).await;
            ToolResponse::ok_json(&result)
        }
        ToolCall::ListMilestones => {
            let milestones = crate::stores::load_milestones(&ctx.paths.milestones_json()).await;
            ToolResponse::ok_json(&ListMilestonesResult { milestones })
        }
        ToolCall::Status => {
            let result = stats::compute_status(ctx.paths).await;
            ToolResponse::ok_json(&result)
        }
    }
}

#[derive(Serialize)]
struct BackupAck;
