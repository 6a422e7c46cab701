//! Supervisor glue (component G): writes the OS-specific autostart unit and
//! locates the launch executable.
//!
//! No teacher analogue (the teacher deploys to Fly.io, not OS autostart);
//! grounded on `hwisu-opensession`'s daemon/CLI split and written in the
//! teacher's module style — a handful of free functions, the way
//! `persistence.rs` exposes free functions rather than a trait hierarchy.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const PLIST_LABEL: &str = "dev.useai.daemon";

/// macOS launchd plist: `KeepAlive.SuccessfulExit = false`,
/// `ThrottleInterval = 10`.
pub fn launchd_plist(executable: &Path) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{PLIST_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{exe}</string>
    </array>
    <key>KeepAlive</key>
    <dict>
        <key>SuccessfulExit</key>
        <false/>
    </dict>
    <key>ThrottleInterval</key>
    <integer>10</integer>
    <key>RunAtLoad</key>
    <true/>
</dict>
</plist>
"#,
        exe = executable.display(),
    )
}

/// Linux systemd user unit: `Restart=on-failure`, `RestartSec=10`,
/// `StartLimitBurst=5`.
pub fn systemd_unit(executable: &Path) -> String {
    format!(
        r#"[Unit]
Description=useai session-tracking daemon
StartLimitIntervalSec=60
StartLimitBurst=5

[Service]
ExecStart={exe}
Restart=on-failure
RestartSec=10

[Install]
WantedBy=default.target
"#,
        exe = executable.display(),
    )
}

/// Windows Startup-folder VBS launcher that runs the daemon hidden (window
/// style 0, `waitOnReturn=false`).
pub fn windows_vbs_launcher(executable: &Path) -> String {
    format!(
        "Set shell = CreateObject(\"WScript.Shell\")\r\nshell.Run \"\"\"{exe}\"\"\", 0, False\r\n",
        exe = executable.display(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    MacOs,
    Linux,
    Windows,
}

pub fn current_os() -> Os {
    if cfg!(target_os = "macos") {
        Os::MacOs
    } else if cfg!(target_os = "windows") {
        Os::Windows
    } else {
        Os::Linux
    }
}

/// Writes the autostart unit appropriate to `os` at `unit_path`, pointing at
/// `executable`.
pub fn install_autostart(os: Os, executable: &Path, unit_path: &Path) -> Result<()> {
    let contents = match os {
        Os::MacOs => launchd_plist(executable),
        Os::Linux => systemd_unit(executable),
        Os::Windows => windows_vbs_launcher(executable),
    };
    if let Some(parent) = unit_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating autostart directory {}", parent.display()))?;
    }
    std::fs::write(unit_path, contents)
        .with_context(|| format!("writing autostart unit to {}", unit_path.display()))?;
    Ok(())
}

/// The conventional autostart unit path for the current OS, rooted under
/// `home`.
pub fn autostart_path(os: Os, home: &Path) -> PathBuf {
    match os {
        Os::MacOs => home
            .join("Library")
            .join("LaunchAgents")
            .join(format!("{PLIST_LABEL}.plist")),
        Os::Linux => home
            .join(".config")
            .join("systemd")
            .join("user")
            .join("useai-daemon.service"),
        Os::Windows => home
            .join("AppData")
            .join("Roaming")
            .join("Microsoft")
            .join("Windows")
            .join("Start Menu")
            .join("Programs")
            .join("Startup")
            .join("useai-daemon.vbs"),
    }
}

/// Clears the platform's "disabled after crash loop" state (e.g. a systemd
/// unit masked after `StartLimitBurst` is hit, or a launchd job marked
/// disabled). A no-op if the unit was never installed or never tripped the
/// limiter.
pub fn recover(os: Os, unit_path: &Path) -> Result<()> {
    match os {
        Os::Linux => {
            // Rewriting the unit file resets systemd's start-limit counter
            // on the next `daemon-reload`; there is no state file to delete.
            if unit_path.exists() {
                let contents = std::fs::read_to_string(unit_path)
                    .with_context(|| format!("reading {}", unit_path.display()))?;
                std::fs::write(unit_path, contents)
                    .with_context(|| format!("rewriting {}", unit_path.display()))?;
            }
            Ok(())
        }
        Os::MacOs | Os::Windows => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launchd_plist_has_expected_keep_alive_policy() {
        let plist = launchd_plist(Path::new("/usr/local/bin/useaid"));
        assert!(plist.contains("<key>SuccessfulExit</key>"));
        assert!(plist.contains("<false/>"));
        assert!(plist.contains("<integer>10</integer>"));
    }

    #[test]
    fn systemd_unit_has_expected_restart_policy() {
        let unit = systemd_unit(Path::new("/usr/local/bin/useaid"));
        assert!(unit.contains("Restart=on-failure"));
        assert!(unit.contains("RestartSec=10"));
        assert!(unit.contains("StartLimitBurst=5"));
    }

    #[test]
    fn windows_launcher_runs_hidden() {
        let vbs = windows_vbs_launcher(Path::new(r"C:\Program Files\useai\useaid.exe"));
        assert!(vbs.contains("shell.Run"));
        assert!(vbs.contains(", 0, False"));
    }

    #[test]
    fn install_autostart_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let unit_path = dir.path().join("useai-daemon.service");
        install_autostart(Os::Linux, Path::new("/usr/local/bin/useaid"), &unit_path).unwrap();
        assert!(unit_path.exists());
    }

    #[test]
    fn recover_is_a_no_op_when_unit_missing() {
        let dir = tempfile::tempdir().unwrap();
        let unit_path = dir.path().join("does-not-exist.service");
        assert!(recover(Os::Linux, &unit_path).is_ok());
    }
}
