// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Nonvolatile file helpers.
//!
//! Settings that survive a restart (I&M data, port peer checks) are kept
//! as small binary files in a caller-chosen directory. Saves compare with
//! the stored content first so unchanged data never touches the medium.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

/// Outcome of [`save_if_modified`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Stored content already matched; nothing written.
    Unchanged,
    /// Existing file updated.
    Updated,
    /// File written for the first time.
    Created,
}

fn file_path(directory: &Path, filename: &str) -> PathBuf {
    directory.join(filename)
}

/// Load a file's full contents, or `None` if it does not exist or cannot
/// be read.
pub fn load(directory: &Path, filename: &str) -> Option<Vec<u8>> {
    let path = file_path(directory, filename);
    match fs::read(&path) {
        Ok(data) => {
            debug!("loaded {} ({} bytes)", path.display(), data.len());
            Some(data)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("could not read {}: {}", path.display(), e);
            None
        }
    }
}

/// Write `data` unless the stored content already matches.
pub fn save_if_modified(
    directory: &Path,
    filename: &str,
    data: &[u8],
) -> io::Result<SaveOutcome> {
    let path = file_path(directory, filename);
    let existing = load(directory, filename);
    match existing {
        Some(current) if current == data => {
            debug!("{} unchanged, not saving", path.display());
            Ok(SaveOutcome::Unchanged)
        }
        Some(_) => {
            info!("updating {}", path.display());
            fs::write(&path, data)?;
            Ok(SaveOutcome::Updated)
        }
        None => {
            info!("first save of {}", path.display());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, data)?;
            Ok(SaveOutcome::Created)
        }
    }
}

/// Remove a stored file if present.
pub fn clear(directory: &Path, filename: &str) {
    let path = file_path(directory, filename);
    match fs::remove_file(&path) {
        Ok(()) => info!("removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("could not remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_clear_cycle() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(None, load(dir.path(), "im.dat"));

        assert_eq!(
            SaveOutcome::Created,
            save_if_modified(dir.path(), "im.dat", b"abc").unwrap()
        );
        assert_eq!(Some(b"abc".to_vec()), load(dir.path(), "im.dat"));

        assert_eq!(
            SaveOutcome::Unchanged,
            save_if_modified(dir.path(), "im.dat", b"abc").unwrap()
        );
        assert_eq!(
            SaveOutcome::Updated,
            save_if_modified(dir.path(), "im.dat", b"abcd").unwrap()
        );

        clear(dir.path(), "im.dat");
        assert_eq!(None, load(dir.path(), "im.dat"));
        // Clearing a missing file is quiet.
        clear(dir.path(), "im.dat");
    }
}
