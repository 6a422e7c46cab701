//! Resolves the on-disk layout described in spec §4.D.
//!
//! `USEAI_HOME` overrides the base directory (tests and the E2E scenarios in
//! `tests/` use this); otherwise a platform-specific default is used via
//! `directories::ProjectDirs`, the way `opensession`'s `crates/paths` crate
//! centralizes base-directory resolution instead of hardcoding one constant
//! per file the way the teacher's `persistence.rs` did.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    /// Resolves the base directory: `USEAI_HOME` if set, else the platform
    /// default (`~/.local/share/useai` on Linux, `~/Library/Application
    /// Support/useai` on macOS, `%APPDATA%\useai` on Windows).
    pub fn resolve() -> Self {
        let base = std::env::var_os("USEAI_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                ProjectDirs::from("dev", "useai", "useai")
                    .map(|dirs| dirs.data_dir().to_path_buf())
                    .unwrap_or_else(|| PathBuf::from(".useai"))
            });
        Self { base }
    }

    pub fn from_base(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config_json(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn sessions_json(&self) -> PathBuf {
        self.base.join("sessions.json")
    }

    pub fn milestones_json(&self) -> PathBuf {
        self.base.join("milestones.json")
    }

    pub fn keystore_json(&self) -> PathBuf {
        self.base.join("keystore.json")
    }

    pub fn active_dir(&self) -> PathBuf {
        self.base.join("data").join("active")
    }

    pub fn sealed_dir(&self) -> PathBuf {
        self.base.join("data").join("sealed")
    }

    pub fn active_chain(&self, session_id: &str) -> PathBuf {
        self.active_dir().join(format!("{session_id}.jsonl"))
    }

    pub fn sealed_chain(&self, session_id: &str) -> PathBuf {
        self.sealed_dir().join(format!("{session_id}.jsonl"))
    }

    pub fn daemon_pid(&self) -> PathBuf {
        self.base.join("daemon.pid")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.base.join("daemon.log")
    }

    /// Ensures the base directory and the `data/active`/`data/sealed`
    /// subdirectories exist.
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.active_dir()).await?;
        tokio::fs::create_dir_all(self.sealed_dir()).await?;
        Ok(())
    }
}
