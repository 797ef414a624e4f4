// Stem Cache - per voice and target file layout with change detection
// Inputs are rewritten only when their content changes so mtimes stay meaningful

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Files belonging to one voice in one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemPaths {
    pub midi: PathBuf,
    pub settings: PathBuf,
    pub stem: PathBuf,
}

impl StemPaths {
    /// Inputs whose change invalidates the stem
    pub fn inputs(&self) -> [&Path; 2] {
        [&self.midi, &self.settings]
    }
}

/// `<dir>/<voice>-<target>.mid`, `.settings.json` and `.wav`
pub fn stem_paths(dir: &Path, voice: &str, target: &str) -> StemPaths {
    let base = format!("{}-{}", voice, target);
    StemPaths {
        midi: dir.join(format!("{}.mid", base)),
        settings: dir.join(format!("{}.settings.json", base)),
        stem: dir.join(format!("{}.wav", base)),
    }
}

/// Calculate SHA256 hash of data
pub fn calculate_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Write `data` unless the file already holds the same bytes
///
/// Returns whether the file was written.
pub fn write_if_changed(path: &Path, data: &[u8]) -> std::io::Result<bool> {
    match fs::read(path) {
        Ok(existing) if calculate_sha256(&existing) == calculate_sha256(data) => {
            log::debug!("Unchanged: {}", path.display());
            return Ok(false);
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)?;
    Ok(true)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Stem exists and is strictly newer than every input
///
/// A missing input makes the stem stale.
pub fn is_fresh(stem: &Path, inputs: &[&Path]) -> bool {
    let Some(stem_time) = modified(stem) else {
        return false;
    };
    inputs
        .iter()
        .all(|input| modified(input).is_some_and(|time| stem_time > time))
}

/// Remove a stale or partial stem; a missing file is not an error
pub fn discard(stem: &Path) -> std::io::Result<()> {
    match fs::remove_file(stem) {
        Ok(()) => {
            log::debug!("Removed {}", stem.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Copy a prepared stem in place of rendering
pub fn copy_override(source: &Path, stem: &Path) -> std::io::Result<()> {
    if let Some(parent) = stem.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, stem)?;
    log::info!("Using override {} for {}", source.display(), stem.display());
    Ok(())
}
