//! Checkpoint directory enumeration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use super::runtime::CONFIG_FILE;

/// File extensions treated as checkpoints.
pub const CHECKPOINT_EXTENSIONS: [&str; 4] = ["pt", "pth", "ckpt", "safetensors"];

/// A compact, user-facing view of one checkpoint on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointEntry {
    /// Path relative to the scanned models directory.
    pub path: PathBuf,
    pub file_name: String,
    /// Parent directory relative to the models directory; empty at the root.
    pub group: String,
    pub size_bytes: u64,
    /// Whether a companion config sits beside the checkpoint.
    pub has_config: bool,
    /// The extension the checkpoint was matched on.
    pub format: String,
}

/// Enumerate checkpoint files under `models_dir`, recursively.
///
/// Best-effort: unreadable directories and entries are skipped, and a
/// missing directory yields an empty list rather than an error.
#[must_use]
pub fn list_checkpoints(models_dir: &Path) -> Vec<CheckpointEntry> {
    let mut entries = Vec::new();
    visit(models_dir, models_dir, &mut entries);
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

fn visit(dir: &Path, root: &Path, out: &mut Vec<CheckpointEntry>) {
    let Ok(read_dir) = fs::read_dir(dir) else {
        debug!(dir = %dir.display(), "skipping unreadable directory");
        return;
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.is_dir() {
            visit(&path, root, out);
            continue;
        }
        let Some(format) = checkpoint_format(&path) else {
            continue;
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let group = relative
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let has_config = path
            .parent()
            .is_some_and(|parent| parent.join(CONFIG_FILE).is_file());
        out.push(CheckpointEntry {
            path: relative,
            file_name,
            group,
            size_bytes: metadata.len(),
            has_config,
            format: format.to_owned(),
        });
    }
}

fn checkpoint_format(path: &Path) -> Option<&str> {
    let extension = path.extension()?.to_str()?;
    CHECKPOINT_EXTENSIONS
        .iter()
        .find(|&&known| known == extension)
        .copied()
}
