//! Endpoint naming for the IPC transports.
//!
//! An endpoint is always given as a filesystem path. The socket backend binds
//! to it directly; the pipe backend derives a pipe name from its canonical
//! form so that the daemon and its clients agree on the same name.

use crate::IpcError;
use std::path::{Path, PathBuf};

/// Environment variable to override the endpoint path.
pub const ENDPOINT_ENV_VAR: &str = "FSMONITOR_ENDPOINT";

/// File name of the endpoint inside a `.git` directory.
pub const ENDPOINT_FILE_NAME: &str = "fsmonitor--daemon.ipc";

/// Namespace prefix of Windows named pipes.
pub const PIPE_PREFIX: &str = r"\\.\pipe\";

/// The published address of a daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    path: PathBuf,
}

impl Endpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default endpoint for a worktree root.
    ///
    /// Resolution order:
    /// 1. `FSMONITOR_ENDPOINT` environment variable
    /// 2. `<root>/.git/fsmonitor--daemon.ipc` if `<root>/.git` is a directory
    /// 3. `<root>/.fsmonitor--daemon.ipc`
    #[must_use]
    pub fn for_worktree(root: &Path) -> Self {
        if let Ok(path) = std::env::var(ENDPOINT_ENV_VAR) {
            return Self::new(path);
        }

        let git_dir = root.join(".git");
        if git_dir.is_dir() {
            Self::new(git_dir.join(ENDPOINT_FILE_NAME))
        } else {
            Self::new(root.join(format!(".{ENDPOINT_FILE_NAME}")))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Derive the named-pipe name for this endpoint.
    ///
    /// The endpoint file itself need not exist, but its parent directory must
    /// resolve.
    pub fn pipe_name(&self) -> Result<String, IpcError> {
        let canonical = canonicalize_lenient(&self.path).map_err(|e| IpcError::InvalidEndpoint {
            endpoint: self.path.clone(),
            reason: format!("could not normalize: {e}"),
        })?;
        let canonical = canonical.to_str().ok_or_else(|| IpcError::InvalidEndpoint {
            endpoint: self.path.clone(),
            reason: "path is not valid unicode".to_string(),
        })?;
        Ok(pipe_name_from_canonical(canonical))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl From<PathBuf> for Endpoint {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

/// Canonicalize `path`, allowing the last component to be missing.
fn canonicalize_lenient(path: &Path) -> std::io::Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(resolved) => Ok(resolved),
        Err(e) => {
            let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                return Err(e);
            };
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            Ok(std::fs::canonicalize(parent)?.join(name))
        }
    }
}

/// Map a canonical path onto the pipe namespace.
///
/// `C:/repo/.git/x` and `C:\repo\.git\x` both become
/// `\\.\pipe\C_\repo\.git\x`. A verbatim `\\?\` prefix, as produced by
/// `std::fs::canonicalize` on Windows, is dropped first.
#[must_use]
pub fn pipe_name_from_canonical(canonical: &str) -> String {
    let trimmed = canonical.strip_prefix(r"\\?\").unwrap_or(canonical);

    let mut name = String::with_capacity(PIPE_PREFIX.len() + trimmed.len());
    name.push_str(PIPE_PREFIX);

    let mut chars = trimmed.chars();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        name.push(bytes[0] as char);
        name.push('_');
        chars.next();
        chars.next();
    }

    for c in chars {
        name.push(if c == '/' { '\\' } else { c });
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_name_drive_prefix() {
        assert_eq!(
            pipe_name_from_canonical("C:/work/repo/.git/fsmonitor--daemon.ipc"),
            r"\\.\pipe\C_\work\repo\.git\fsmonitor--daemon.ipc"
        );
    }

    #[test]
    fn test_pipe_name_strips_verbatim_prefix() {
        assert_eq!(
            pipe_name_from_canonical(r"\\?\D:\src\repo\x.ipc"),
            r"\\.\pipe\D_\src\repo\x.ipc"
        );
    }

    #[test]
    fn test_pipe_name_unix_style_path() {
        assert_eq!(
            pipe_name_from_canonical("/home/me/repo/.git/x"),
            r"\\.\pipe\\home\me\repo\.git\x"
        );
    }

    #[test]
    fn test_pipe_name_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::new(dir.path().join("not-yet.ipc"));
        let name = endpoint.pipe_name().unwrap();
        assert!(name.starts_with(PIPE_PREFIX));
        assert!(name.ends_with("not-yet.ipc"));
    }

    #[test]
    fn test_pipe_name_unresolvable_parent() {
        let endpoint = Endpoint::new("/nonexistent/dir/for/fsmonitor/x.ipc");
        assert!(matches!(
            endpoint.pipe_name(),
            Err(IpcError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_for_worktree_prefers_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        if std::env::var(ENDPOINT_ENV_VAR).is_ok() {
            return;
        }
        let endpoint = Endpoint::for_worktree(dir.path());
        assert_eq!(
            endpoint.path(),
            dir.path().join(".git").join(ENDPOINT_FILE_NAME)
        );
    }

    #[test]
    fn test_for_worktree_without_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        if std::env::var(ENDPOINT_ENV_VAR).is_ok() {
            return;
        }
        let endpoint = Endpoint::for_worktree(dir.path());
        assert_eq!(endpoint.path(), dir.path().join(".fsmonitor--daemon.ipc"));
    }
}
