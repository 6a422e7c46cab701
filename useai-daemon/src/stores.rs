//! Atomic JSON stores and the per-session JSONL chain files.
//!
//! Grounded on `persistence.rs`'s load-with-default / save-by-overwrite
//! shape, generalized to the temp-file + fsync + rename protocol spec §4.D
//! requires: a reader can never observe a partial write, and a missing or
//! malformed file is always treated as the supplied default rather than an
//! error.

use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use useai_types::{ChainRecord, Milestone, PersistentConfig, SessionSeal};

/// Writes `bytes` to `path` via `path.<pid>.tmp` -> fsync -> rename, so a
/// reader never observes a half-written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let pid = std::process::id();
    let tmp_path = path.with_extension(format!("{pid}.tmp"));

    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Reads and parses a JSON file, returning `default` if the file is missing
/// or malformed. Malformed contents are logged, never surfaced as an error.
pub async fn read_json_or_default<T>(path: &Path, default: T) -> T
where
    T: serde::de::DeserializeOwned,
{
    match fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!("failed to parse {}: {e}, using default", path.display());
                default
            }
        },
        Err(_) => default,
    }
}

async fn write_json(path: &Path, value: &impl serde::Serialize) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).expect("in-memory value always serializes");
    write_atomic(path, &bytes).await
}

// ── Config store ───────────────────────────────────────────────────────────────

pub async fn load_config(path: &Path) -> PersistentConfig {
    read_json_or_default(path, PersistentConfig::default()).await
}

pub async fn save_config(path: &Path, config: &PersistentConfig) -> std::io::Result<()> {
    write_json(path, config).await
}

// ── Sessions-list store ─────────────────────────────────────────────────────────

pub async fn load_sessions(path: &Path) -> Vec<SessionSeal> {
    read_json_or_default(path, Vec::new()).await
}

/// Appends one seal to the sessions-list store. Append-only in practice: the
/// whole list is re-read, extended, and written back atomically (no seal is
/// ever mutated in place).
pub async fn append_session(path: &Path, seal: SessionSeal) -> std::io::Result<()> {
    let mut sessions = load_sessions(path).await;
    sessions.push(seal);
    write_json(path, &sessions).await
}

// ── Milestones-list store ───────────────────────────────────────────────────────

pub async fn load_milestones(path: &Path) -> Vec<Milestone> {
    read_json_or_default(path, Vec::new()).await
}

/// Upserts a milestone by `id`: an existing entry with the same id is
/// replaced, otherwise the milestone is appended.
pub async fn upsert_milestone(path: &Path, milestone: Milestone) -> std::io::Result<()> {
    let mut milestones = load_milestones(path).await;
    match milestones.iter().position(|m| m.id == milestone.id) {
        Some(idx) => milestones[idx] = milestone,
        None => milestones.push(milestone),
    }
    write_json(path, &milestones).await
}

// ── Chain files ─────────────────────────────────────────────────────────────────

/// Appends one record as a JSON line, flushed synchronously, so a partially
/// written record is never observable: the line either lands in full or not
/// at all from the next reader's perspective once `sync_all` returns.
pub async fn append_chain_record(path: &Path, record: &ChainRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(record).expect("ChainRecord always serializes");
    line.push('\n');

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}

/// Reads every complete line of a chain file. A partial trailing line (the
/// process died mid-append) is tolerated and dropped, per spec §5.
pub async fn read_chain_records(path: &Path) -> std::io::Result<Vec<ChainRecord>> {
    let contents = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut records = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(
                    "dropping unparseable trailing line in {}: {e}",
                    path.display()
                );
                break;
            }
        }
    }
    Ok(records)
}

/// Moves a chain file from `ACTIVE/` to `SEALED/` atomically.
pub async fn seal_chain_file(active_path: &Path, sealed_path: &Path) -> std::io::Result<()> {
    if let Some(parent) = sealed_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(active_path, sealed_path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = PersistentConfig {
            sync_interval_hours: 48,
            ..PersistentConfig::default()
        };
        save_config(&path, &config).await.unwrap();
        let loaded = load_config(&path).await;
        assert_eq!(loaded.sync_interval_hours, 48);
    }

    #[tokio::test]
    async fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let loaded = load_config(&path).await;
        assert!(loaded.milestone_tracking);
    }

    #[tokio::test]
    async fn malformed_file_yields_default_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, b"not json").await.unwrap();
        let loaded = load_config(&path).await;
        assert_eq!(loaded.sync_interval_hours, 24);
    }

    #[tokio::test]
    async fn chain_reader_tolerates_partial_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sess.jsonl");
        let mut contents = String::new();
        contents.push_str(r#"{"id":"r0","type":"session_start","session_id":"s","timestamp":"2024-01-01T00:00:00Z","data":{},"prev_hash":"GENESIS","hash":"abc","signature":"unsigned"}"#);
        contents.push('\n');
        contents.push_str(r#"{"id":"r1","type":"heartbeat","session_id":"s"#); // truncated
        fs::write(&path, contents).await.unwrap();

        let records = read_chain_records(&path).await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
