use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::time_utils::current_unix_timestamp_ms;

/// Replaces `path` with `content` through a sibling staging file and a
/// rename, so a crash mid-write leaves either the old file or the new one,
/// never a blend of both.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("refusing to write: empty destination path");
    }
    if path.is_dir() {
        bail!("refusing to write: '{}' is a directory", path.display());
    }

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating parent directory {}", dir.display()))?;

    // The staging file must share the target's filesystem or the rename
    // stops being atomic.
    let staging = staging_path(dir, path);
    std::fs::write(&staging, content)
        .with_context(|| format!("staging write to {}", staging.display()))?;
    std::fs::rename(&staging, path).with_context(|| {
        format!(
            "moving {} into place at {}",
            staging.display(),
            path.display()
        )
    })?;
    Ok(())
}

fn staging_path(dir: &Path, target: &Path) -> PathBuf {
    let stem = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("roster-state");
    dir.join(format!(
        ".{stem}.{}-{}.part",
        std::process::id(),
        current_unix_timestamp_ms()
    ))
}
