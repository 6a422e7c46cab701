//! Statistics view (component H): pure read-side aggregation over the
//! sessions-list store.
//!
//! Grounded on `handlers.rs`'s read-aggregate style (`emit_log` folding over
//! `state.logs`), turned into plain functions over a `Vec<SessionSeal>`
//! rather than mutating shared state.

use std::collections::HashMap;
use std::path::Path;

use chrono::{Local, NaiveDate};
use useai_types::{Milestone, SessionSeal, StatsBreakdown, StatsResult, StatusResult};

use crate::paths::Paths;
use crate::stores;

fn add_duration(map: &mut HashMap<String, f64>, key: String, duration_seconds: f64) {
    *map.entry(key).or_insert(0.0) += duration_seconds;
}

fn breakdown(sessions: &[SessionSeal]) -> StatsBreakdown {
    let mut by_client = HashMap::new();
    let mut by_language = HashMap::new();
    let mut by_task_type = HashMap::new();

    for session in sessions {
        add_duration(&mut by_client, session.client_name.clone(), session.duration_seconds);
        add_duration(
            &mut by_task_type,
            session.task_type.to_string(),
            session.duration_seconds,
        );
        if let Some(primary_language) = session.languages.first() {
            add_duration(&mut by_language, primary_language.clone(), session.duration_seconds);
        }
    }

    StatsBreakdown {
        by_client,
        by_language,
        by_task_type,
    }
}

/// Consecutive calendar days (local TZ) with at least one session started
/// that day, counting backward from today; breaks on the first empty day.
fn day_streak(sessions: &[SessionSeal]) -> u32 {
    let days: std::collections::HashSet<NaiveDate> = sessions
        .iter()
        .map(|s| s.started_at.with_timezone(&Local).date_naive())
        .collect();

    let mut streak = 0u32;
    let mut day = Local::now().date_naive();
    while days.contains(&day) {
        streak += 1;
        day = match day.pred_opt() {
            Some(d) => d,
            None => break,
        };
    }
    streak
}

pub async fn compute_stats(paths: &Paths) -> StatsResult {
    let sessions = stores::load_sessions(&paths.sessions_json()).await;
    let total_duration_seconds = sessions.iter().map(|s| s.duration_seconds).sum();
    let day_streak = day_streak(&sessions);
    let breakdown = breakdown(&sessions);

    StatsResult {
        session_count: sessions.len() as u32,
        total_duration_seconds,
        day_streak,
        breakdown,
    }
}

async fn directory_size(dir: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(e) => e,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => stack.push(path),
                Ok(ft) if ft.is_file() => {
                    if let Ok(metadata) = entry.metadata().await {
                        total += metadata.len();
                    }
                }
                _ => {}
            }
        }
    }
    total
}

fn milestone_counts(milestones: &[Milestone]) -> (u32, u32) {
    let published = milestones.iter().filter(|m| m.published).count() as u32;
    let unpublished = milestones.len() as u32 - published;
    (unpublished, published)
}

pub async fn compute_status(paths: &Paths) -> StatusResult {
    let sessions = stores::load_sessions(&paths.sessions_json()).await;
    let milestones = stores::load_milestones(&paths.milestones_json()).await;
    let config = stores::load_config(&paths.config_json()).await;
    let (unpublished_milestones, published_milestones) = milestone_counts(&milestones);
    let total_bytes_on_disk = directory_size(paths.base()).await;

    StatusResult {
        session_count: sessions.len() as u32,
        unpublished_milestones,
        published_milestones,
        total_bytes_on_disk,
        config,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use useai_types::{MilestoneCategory, MilestoneComplexity, TaskType};

    fn seal(client: &str, task_type: TaskType, languages: Vec<&str>, duration: f64, started_at: chrono::DateTime<Utc>) -> SessionSeal {
        SessionSeal {
            session_id: "s".to_string(),
            conversation_id: "c".to_string(),
            conversation_index: 0,
            client_name: client.to_string(),
            task_type,
            title: None,
            parent_session_id: None,
            started_at,
            ended_at: started_at,
            duration_seconds: duration,
            active_duration_seconds: duration,
            heartbeat_count: 0,
            record_count: 4,
            files_touched_count: 0,
            languages: languages.into_iter().map(|s| s.to_string()).collect(),
            milestone_count: 0,
            chain_start_hash: "GENESIS".to_string(),
            chain_end_hash: "x".to_string(),
            seal_signature: "unsigned".to_string(),
            evaluation: None,
            score: None,
        }
    }

    #[test]
    fn breakdown_sums_duration_by_dimension() {
        let sessions = vec![
            seal("claude-code", TaskType::Coding, vec!["rust"], 10.0, Utc::now()),
            seal("claude-code", TaskType::Debugging, vec!["rust"], 5.0, Utc::now()),
            seal("cursor", TaskType::Coding, vec!["python"], 2.0, Utc::now()),
        ];
        let b = breakdown(&sessions);
        assert_eq!(b.by_client["claude-code"], 15.0);
        assert_eq!(b.by_client["cursor"], 2.0);
        assert_eq!(b.by_language["rust"], 15.0);
        assert_eq!(b.by_task_type["coding"], 12.0);
        assert_eq!(b.by_task_type["debugging"], 5.0);
    }

    #[test]
    fn day_streak_breaks_on_first_empty_day() {
        let today = Utc::now();
        let yesterday = today - Duration::days(1);
        let three_days_ago = today - Duration::days(3);
        let sessions = vec![
            seal("c", TaskType::Coding, vec![], 1.0, today),
            seal("c", TaskType::Coding, vec![], 1.0, yesterday),
            seal("c", TaskType::Coding, vec![], 1.0, three_days_ago),
        ];
        assert_eq!(day_streak(&sessions), 2);
    }

    #[test]
    fn day_streak_is_zero_without_a_session_today() {
        let two_days_ago = Utc::now() - Duration::days(2);
        let sessions = vec![seal("c", TaskType::Coding, vec![], 1.0, two_days_ago)];
        assert_eq!(day_streak(&sessions), 0);
    }

    #[test]
    fn milestone_counts_splits_published_and_unpublished() {
        let milestones = vec![
            Milestone {
                id: "m1".to_string(),
                session_id: "s".to_string(),
                title: "t".to_string(),
                private_title: None,
                category: MilestoneCategory::Feature,
                complexity: MilestoneComplexity::Simple,
                duration_minutes: 1.0,
                languages: vec![],
                client: "c".to_string(),
                created_at: Utc::now(),
                chain_hash: "h".to_string(),
                published: true,
            },
            Milestone {
                id: "m2".to_string(),
                session_id: "s".to_string(),
                title: "t2".to_string(),
                private_title: None,
                category: MilestoneCategory::Bugfix,
                complexity: MilestoneComplexity::Medium,
                duration_minutes: 1.0,
                languages: vec![],
                client: "c".to_string(),
                created_at: Utc::now(),
                chain_hash: "h2".to_string(),
                published: false,
            },
        ];
        let (unpublished, published) = milestone_counts(&milestones);
        assert_eq!(unpublished, 1);
        assert_eq!(published, 1);
    }
}
