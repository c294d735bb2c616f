use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use audio_engine::decode::is_audio_path;

/// Expand command-line paths into playable files.
///
/// Files are kept as given; directories are walked recursively and contribute their audio
/// files sorted by path. Missing paths are kept so the engine reports them when reached.
pub fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found = Vec::new();
            scan_dir(path, &mut found)?;
            found.sort();
            tracing::debug!(dir = ?path, files = found.len(), "expanded directory");
            out.extend(found);
        } else {
            out.push(path.clone());
        }
    }
    Ok(out)
}

fn scan_dir(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read_dir {:?}", dir))? {
        let entry = entry.context("read_dir entry")?;
        let path = entry.path();
        if path.is_dir() {
            scan_dir(&path, found)?;
        } else if path.is_file() && is_audio_path(&path) {
            found.push(path);
        }
    }
    Ok(())
}
