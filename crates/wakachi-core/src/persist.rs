//! Atomic file replacement.
//!
//! Checkpoints, configs and presets are written to a temporary sibling and
//! renamed over the target, so a reader never observes a half-written file.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, WakachiError};

/// Temporary path next to `path`, on the same filesystem so `rename` is atomic.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| WakachiError::io(parent, e))?;
        }
    }
    Ok(())
}

/// Move a fully written temporary file over `path`.
pub fn commit(tmp: &Path, path: &Path) -> Result<()> {
    fs::rename(tmp, path).map_err(|e| {
        let _ = fs::remove_file(tmp);
        WakachiError::io(path, e)
    })
}

/// Write `bytes` to `path` atomically.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let tmp = temp_sibling(path);
    fs::write(&tmp, bytes).map_err(|e| WakachiError::io(&tmp, e))?;
    commit(&tmp, path)
}
