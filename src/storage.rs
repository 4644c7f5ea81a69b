//! Upload validation and temp-file handling.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

/// True iff the filename has an extension and its lowercased form is in
/// `allowed`. Dotless filenames are rejected.
pub fn is_allowed_extension(filename: &str, allowed: &[&str]) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| allowed.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Best-effort MIME type from the filename extension. Unknown extensions map
/// to `application/octet-stream`.
pub fn infer_mime_type(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Reduce a client-supplied filename to a safe single path component: path
/// separators and anything outside `[A-Za-z0-9._-]` become underscores, and
/// leading dots are stripped so the result can never traverse upward or
/// hide as a dotfile. An empty result becomes `upload`.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Write the uploaded bytes into `dir` under a per-request unique name and
/// return the resulting path. The UUID prefix keeps concurrent uploads with
/// identical filenames from colliding.
pub async fn store_upload(bytes: &[u8], filename: &str, dir: &Path) -> io::Result<PathBuf> {
    let safe_name = sanitize_filename(filename);
    let path = dir.join(format!("{}_{}", Uuid::new_v4().simple(), safe_name));
    tokio::fs::write(&path, bytes).await?;
    debug!("stored upload at {}", path.display());
    Ok(path)
}

/// Remove a temp file, swallowing any failure. Cleanup must never fail a
/// request, so errors are logged and reported as `false`.
pub fn delete_temp_file(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => {
            warn!("failed to remove temp file {}: {}", path.display(), err);
            false
        }
    }
}

/// Deletes the wrapped temp file when dropped, so every exit path of a
/// request cleans up after itself.
pub struct TempFileGuard {
    path: PathBuf,
}

impl TempFileGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        delete_temp_file(&self.path);
    }
}
