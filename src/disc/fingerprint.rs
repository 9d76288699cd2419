// Disc fingerprinting
//
// A deterministic blake3 digest over the disc's structural files: relative
// paths, sizes, and the first chunk of each, in sorted order. Blu-ray discs
// hash their BDMV tree, DVDs their VIDEO_TS tree; anything else falls back
// to the mount root. The computation is bounded by a deadline because an
// unreadable disc can hang indefinitely on the first read.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use walkdir::WalkDir;

use crate::constants::{FINGERPRINT_CHUNK_SIZE, FINGERPRINT_MAX_FILES};
use crate::error::{Result, SpindleError};

/// Compute the fingerprint of the disc mounted at `mount`, giving up after
/// `timeout`.
pub fn compute_fingerprint(mount: &Path, timeout: Duration) -> Result<String> {
    let mount = mount.to_path_buf();
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::Builder::new()
        .name("fingerprint".to_string())
        .spawn(move || {
            let _ = tx.send(fingerprint_inner(&mount));
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(SpindleError::ExternalTool(format!(
            "disc fingerprint timed out after {}s (verify the disc is readable)",
            timeout.as_secs()
        ))),
    }
}

fn fingerprint_inner(mount: &Path) -> Result<String> {
    if !mount.exists() {
        return Err(SpindleError::Validation(format!(
            "disc mount {} does not exist",
            mount.display()
        )));
    }

    let root = structural_root(mount);
    let mut files: Vec<(String, PathBuf)> = WalkDir::new(&root)
        .max_depth(3)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e
                .path()
                .strip_prefix(mount)
                .unwrap_or(e.path())
                .to_string_lossy()
                .to_string();
            (rel, e.path().to_path_buf())
        })
        .collect();
    files.sort();
    files.truncate(FINGERPRINT_MAX_FILES);

    if files.is_empty() {
        return Err(SpindleError::Validation(format!(
            "no files under {} to fingerprint",
            root.display()
        )));
    }

    let mut hasher = blake3::Hasher::new();
    let mut chunk = vec![0u8; FINGERPRINT_CHUNK_SIZE];
    for (rel, path) in &files {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        hasher.update(rel.as_bytes());
        hasher.update(&size.to_le_bytes());

        let read = file.read(&mut chunk)?;
        hasher.update(&chunk[..read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Prefer the format-defining directory when present.
fn structural_root(mount: &Path) -> PathBuf {
    for candidate in ["BDMV", "VIDEO_TS"] {
        let dir = mount.join(candidate);
        if dir.is_dir() {
            return dir;
        }
    }
    mount.to_path_buf()
}
