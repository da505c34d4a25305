//! The Filesystem Tool: scoped list/read/write/mkdir/move/delete under the user root
//! (spec §4.G).

use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::{MethingsError, Result};

const MAX_READ_BYTES: u64 = 2 * 1024 * 1024; // clamp ceiling (1024..2 MiB)
const MIN_READ_BYTES: u64 = 1024;
const MAX_BACKUPS: usize = 14;

/// Resolve `path` under `root`, rejecting escapes. Grounded on the teacher's
/// filesystem tool, which canonicalizes both sides and checks containment; here we
/// fall back to lexical normalisation for targets that don't exist yet (a fresh
/// `write_file` destination has nothing to canonicalize).
pub fn resolve_under_root(root: &Path, path: &str) -> Result<PathBuf> {
    let joined = root.join(path.trim_start_matches('/'));
    let resolved = match joined.canonicalize() {
        Ok(p) => p,
        Err(_) => lexical_normalize(&joined),
    };
    let root_resolved = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    if resolved == root_resolved || resolved.starts_with(&root_resolved) {
        Ok(resolved)
    } else {
        Err(MethingsError::PathOutsideUserDir)
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                if matches!(components.last(), Some(std::path::Component::Normal(_))) {
                    components.pop();
                }
            }
            std::path::Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListDirResult {
    pub entries: Vec<DirEntry>,
    pub truncated: bool,
}

pub fn list_dir(root: &Path, path: &str, show_hidden: bool, limit: u32) -> Result<ListDirResult> {
    let limit = limit.clamp(1, 5000) as usize;
    let target = resolve_under_root(root, path)?;
    let read_dir = std::fs::read_dir(&target).map_err(|_| MethingsError::InvalidPath)?;

    let mut names: Vec<std::fs::DirEntry> = read_dir
        .filter_map(|e| e.ok())
        .filter(|e| {
            show_hidden || !e.file_name().to_string_lossy().starts_with('.')
        })
        .collect();
    names.sort_by_key(|e| e.file_name().to_string_lossy().to_lowercase());

    let truncated = names.len() > limit;
    let mut entries = Vec::with_capacity(limit.min(names.len()));
    for entry in names.into_iter().take(limit) {
        let meta = entry.metadata().map_err(|_| MethingsError::InvalidPath)?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            kind: if meta.is_dir() { "dir".to_string() } else { "file".to_string() },
            size: meta.len(),
            mtime,
        });
    }
    Ok(ListDirResult { entries, truncated })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadFileResult {
    pub content: String,
    pub truncated: bool,
}

pub fn read_file(root: &Path, path: &str, max_bytes: u64) -> Result<ReadFileResult> {
    let max_bytes = max_bytes.clamp(MIN_READ_BYTES, MAX_READ_BYTES);
    let target = resolve_under_root(root, path)?;
    let meta = std::fs::metadata(&target).map_err(|_| MethingsError::InvalidPath)?;
    let truncated = meta.len() > max_bytes;
    let bytes = std::fs::read(&target).map_err(|_| MethingsError::InvalidPath)?;
    let capped = if (bytes.len() as u64) > max_bytes {
        &bytes[..max_bytes as usize]
    } else {
        &bytes[..]
    };
    Ok(ReadFileResult {
        content: String::from_utf8_lossy(capped).to_string(),
        truncated,
    })
}

pub fn write_file(root: &Path, path: &str, content: &str) -> Result<()> {
    let joined = root.join(path.trim_start_matches('/'));
    let target = resolve_write_target(root, &joined)?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| anyhow::anyhow!(e))?;
    }
    if target.exists() {
        backup_file(&target);
    }
    std::fs::write(&target, content).map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

fn resolve_write_target(root: &Path, joined: &Path) -> Result<PathBuf> {
    let resolved = lexical_normalize(joined);
    let root_resolved = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    if resolved == root_resolved || resolved.starts_with(&root_resolved) {
        Ok(resolved)
    } else {
        Err(MethingsError::PathOutsideUserDir)
    }
}

/// Resolve an arbitrary (possibly not-yet-existing) write destination under `root`,
/// rejecting escapes. Shared with the Shell Sandbox's curl emulator for its `-o`
/// output path (spec §4.F: "Output written to a `-o` path is first resolved through
/// the same user-root check; escape fails the call").
pub fn resolve_write_target_for_shell(root: &Path, path: &str) -> Result<PathBuf> {
    resolve_write_target(root, &root.join(path.trim_start_matches('/')))
}

fn backup_file(file_path: &Path) {
    let Some(parent) = file_path.parent() else { return };
    let backup_dir = parent.join(".methings-backups");
    let Some(filename) = file_path.file_name().and_then(|f| f.to_str()) else {
        return;
    };
    if let Err(e) = std::fs::create_dir_all(&backup_dir) {
        warn!("failed to create backup dir {}: {e}", backup_dir.display());
        return;
    }
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");
    let backup_path = backup_dir.join(format!("{filename}.{timestamp}"));
    if std::fs::copy(file_path, &backup_path).is_err() {
        return;
    }
    let prefix = format!("{filename}.");
    let mut backups: Vec<PathBuf> = std::fs::read_dir(&backup_dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            (name.starts_with(&prefix) && entry.path().is_file()).then(|| entry.path())
        })
        .collect();
    if backups.len() > MAX_BACKUPS {
        backups.sort();
        for old in &backups[..backups.len() - MAX_BACKUPS] {
            let _ = std::fs::remove_file(old);
        }
    }
}

pub fn mkdir(root: &Path, path: &str, parents: bool) -> Result<()> {
    let target = resolve_write_target(root, &root.join(path.trim_start_matches('/')))?;
    if parents {
        std::fs::create_dir_all(&target).map_err(|e| anyhow::anyhow!(e))?;
    } else if let Err(e) = std::fs::create_dir(&target) {
        if e.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(anyhow::anyhow!(e).into());
        }
    }
    Ok(())
}

pub fn move_path(root: &Path, src: &str, dst: &str, overwrite: bool) -> Result<()> {
    let src_target = resolve_under_root(root, src)?;
    let dst_target = resolve_write_target(root, &root.join(dst.trim_start_matches('/')))?;
    if dst_target.exists() && !overwrite {
        return Err(MethingsError::PathNotAllowed);
    }
    if let Some(parent) = dst_target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| anyhow::anyhow!(e))?;
    }
    std::fs::rename(&src_target, &dst_target).map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

pub fn delete_path(root: &Path, path: &str, recursive: bool) -> Result<bool> {
    let target = resolve_under_root(root, path)?;
    if !target.exists() {
        return Ok(false);
    }
    if target.is_dir() {
        if recursive {
            std::fs::remove_dir_all(&target).map_err(|e| anyhow::anyhow!(e))?;
        } else {
            std::fs::remove_dir(&target).map_err(|e| anyhow::anyhow!(e))?;
        }
    } else {
        std::fs::remove_file(&target).map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(true)
}

/// Dispatch a `{op, ...}` filesystem payload (used by both the `filesystem` tool and
/// the `filesystem` action type in the Brain Runtime, spec §4.H).
pub fn dispatch(root: &Path, op: &str, args: &Value) -> Result<Value> {
    match op {
        "list_dir" => {
            let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
            let show_hidden = args.get("show_hidden").and_then(|v| v.as_bool()).unwrap_or(false);
            let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(1000) as u32;
            let result = list_dir(root, path, show_hidden, limit)?;
            Ok(serde_json::to_value(result).unwrap())
        }
        "read_file" => {
            let path = args
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or(MethingsError::InvalidPath)?;
            let max_bytes = args.get("max_bytes").and_then(|v| v.as_u64()).unwrap_or(MAX_READ_BYTES);
            let result = read_file(root, path, max_bytes)?;
            Ok(serde_json::to_value(result).unwrap())
        }
        "mkdir" => {
            let path = args
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or(MethingsError::InvalidPath)?;
            let parents = args.get("parents").and_then(|v| v.as_bool()).unwrap_or(true);
            mkdir(root, path, parents)?;
            Ok(serde_json::json!({"status": "ok"}))
        }
        "move_path" => {
            let src = args.get("src").and_then(|v| v.as_str()).ok_or(MethingsError::InvalidPath)?;
            let dst = args.get("dst").and_then(|v| v.as_str()).ok_or(MethingsError::InvalidPath)?;
            let overwrite = args.get("overwrite").and_then(|v| v.as_bool()).unwrap_or(false);
            move_path(root, src, dst, overwrite)?;
            Ok(serde_json::json!({"status": "ok"}))
        }
        "delete_path" => {
            let path = args
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or(MethingsError::InvalidPath)?;
            let recursive = args.get("recursive").and_then(|v| v.as_bool()).unwrap_or(false);
            let deleted = delete_path(root, path, recursive)?;
            Ok(serde_json::json!({"deleted": deleted}))
        }
        _ => Err(MethingsError::UnsupportedFsOp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn read_write_round_trip() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "notes/a.txt", "hello").unwrap();
        let result = read_file(dir.path(), "notes/a.txt", 1024).unwrap();
        assert_eq!(result.content, "hello");
        assert!(!result.truncated);
    }

    #[test]
    fn path_escape_is_rejected() {
        let dir = tempdir().unwrap();
        let err = read_file(dir.path(), "../../etc/passwd", 1024).unwrap_err();
        assert!(matches!(err, MethingsError::PathOutsideUserDir));
    }

    #[test]
    fn write_backs_up_previous_version() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "a.txt", "v1").unwrap();
        write_file(dir.path(), "a.txt", "v2").unwrap();
        let backups: Vec<_> = std::fs::read_dir(dir.path().join(".methings-backups"))
            .unwrap()
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn move_path_refuses_existing_dst_without_overwrite() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "a.txt", "a").unwrap();
        write_file(dir.path(), "b.txt", "b").unwrap();
        let err = move_path(dir.path(), "a.txt", "b.txt", false).unwrap_err();
        assert!(matches!(err, MethingsError::PathNotAllowed));
        move_path(dir.path(), "a.txt", "b.txt", true).unwrap();
        assert_eq!(read_file(dir.path(), "b.txt", 1024).unwrap().content, "a");
    }

    #[test]
    fn delete_missing_path_is_ok_false() {
        let dir = tempdir().unwrap();
        let deleted = delete_path(dir.path(), "nope.txt", false).unwrap();
        assert!(!deleted);
    }

    #[test]
    fn mkdir_is_idempotent() {
        let dir = tempdir().unwrap();
        mkdir(dir.path(), "sub", false).unwrap();
        mkdir(dir.path(), "sub", false).unwrap();
    }
}
