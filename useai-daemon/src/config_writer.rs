//! External-config writers (component I): the thin boundary the daemon
//! exposes to AI-tool config writers, plus one concrete example.
//!
//! Out of scope per spec.md §1: the concrete per-tool formats live outside
//! this workspace. This module only defines the trait boundary and one
//! in-repo writer (a TOML snippet merge) so the boundary is exercised by a
//! real implementation, per SPEC_FULL.md §4.I. Grounded on `persistence.rs`'s
//! free-function style rather than a trait-object hierarchy.

use std::path::Path;

use toml::Value;

/// What an AI-tool config writer needs from the daemon: the port it's
/// listening on, and nothing else — concrete per-tool snippet shape is an
/// external collaborator's concern.
pub trait ConfigWriter {
    /// Merges a useai launcher snippet into the tool's own config file at
    /// `path`, creating the file if it doesn't exist. Returns `true` if the
    /// file was changed.
    fn merge(&self, path: &Path, daemon_port: u16) -> std::io::Result<bool>;
}

/// Merges a `[tools.useai]` table into a TOML config file, the shape an
/// MCP-style tool launcher entry takes in tools like Zed or Cursor.
pub struct TomlConfigWriter {
    pub command: String,
}

impl ConfigWriter for TomlConfigWriter {
    fn merge(&self, path: &Path, daemon_port: u16) -> std::io::Result<bool> {
        let mut doc: Value = match std::fs::read_to_string(path) {
            Ok(contents) => contents.parse().unwrap_or_else(|_| Value::Table(Default::default())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Table(Default::default()),
            Err(e) => return Err(e),
        };

        let table = doc.as_table_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "config root is not a table")
        })?;

        let tools = table
            .entry("tools")
            .or_insert_with(|| Value::Table(Default::default()));
        let tools_table = tools.as_table_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "tools is not a table")
        })?;

        let mut useai_entry = toml::map::Map::new();
        useai_entry.insert("command".to_string(), Value::String(self.command.clone()));
        useai_entry.insert(
            "url".to_string(),
            Value::String(format!("http://127.0.0.1:{daemon_port}/mcp")),
        );
        let new_entry = Value::Table(useai_entry);

        let changed = tools_table.get("useai") != Some(&new_entry);
        tools_table.insert("useai".to_string(), new_entry);

        if changed {
            let rendered = toml::to_string_pretty(&doc)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, rendered)?;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_creates_file_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool.toml");
        let writer = TomlConfigWriter {
            command: "useaid".to_string(),
        };

        let changed = writer.merge(&path, 9999).unwrap();
        assert!(changed);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("127.0.0.1:9999"));
    }

    #[test]
    fn merge_is_a_no_op_when_already_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool.toml");
        let writer = TomlConfigWriter {
            command: "useaid".to_string(),
        };

        writer.merge(&path, 9999).unwrap();
        let changed_again = writer.merge(&path, 9999).unwrap();
        assert!(!changed_again);
    }

    #[test]
    fn merge_preserves_unrelated_existing_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool.toml");
        std::fs::write(&path, "[tools.other]\ncommand = \"other-tool\"\n").unwrap();

        let writer = TomlConfigWriter {
            command: "useaid".to_string(),
        };
        writer.merge(&path, 9999).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("other-tool"));
        assert!(contents.contains("useaid"));
    }
}
