//! File-path handling for queued jobs.
//!
//! Queue payloads carry relative paths produced on mixed platforms, so
//! separators are normalized to forward slashes before joining onto the
//! configured music mount.

use std::path::{Path, PathBuf};

use crate::errors::JobError;

/// Normalize separators and join a job's relative path onto the music root.
///
/// Rejects paths that escape the mount via `..` components; such payloads are
/// permanently failed rather than retried.
pub fn resolve_track_path(music_root: &str, file_path: &str) -> Result<PathBuf, JobError> {
    let normalized = file_path.replace('\\', "/");

    if normalized
        .split('/')
        .any(|component| component == "..")
    {
        return Err(JobError::permanent(format!(
            "Invalid file path (parent traversal): {}",
            file_path
        )));
    }

    let relative = normalized.trim_start_matches('/');
    Ok(Path::new(music_root).join(relative))
}

/// Remove characters that are invalid on common filesystems from a single
/// path component (used when rendering download templates).
pub fn sanitize_path_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    cleaned.trim_matches(['.', ' ']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_normalizes_backslashes() {
        let path = resolve_track_path("/music", "Artist\\Album\\01. Song.flac").unwrap();
        assert_eq!(path, PathBuf::from("/music/Artist/Album/01. Song.flac"));
    }

    #[test]
    fn test_resolve_strips_leading_slash() {
        let path = resolve_track_path("/music", "/a/b.flac").unwrap();
        assert_eq!(path, PathBuf::from("/music/a/b.flac"));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let err = resolve_track_path("/music", "../etc/passwd").unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_path_component("AC/DC: Live?"), "AC_DC_ Live_");
        assert_eq!(sanitize_path_component(" trailing. "), "trailing");
    }
}
