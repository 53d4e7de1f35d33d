//! Filesystem sandbox root enforcement for guest file SWIs.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("filesystem root is not configured")]
    RootUnset,
    #[error("empty path")]
    EmptyPath,
    #[error("path contains a '..' component")]
    ParentComponent,
    #[error("resolved path escapes the filesystem root")]
    Escape,
    #[error("failed to resolve path: {0}")]
    Io(String),
}

/// Validates a guest-supplied path against `root`, checking in order:
/// unset root, empty path, `..` components, absolute-as-relative, then canonicalization with
/// a prefix check. Returns the host path to operate on, or a [`SandboxError`] that the caller
/// must treat as a VM-integrity (halting) error, never as an ordinary I/O failure.
pub fn resolve(root: Option<&Path>, guest_path: &str) -> Result<PathBuf, SandboxError> {
    let root = root.ok_or(SandboxError::RootUnset)?;
    if guest_path.is_empty() {
        return Err(SandboxError::EmptyPath);
    }
    let guest = Path::new(guest_path);
    if guest.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(SandboxError::ParentComponent);
    }
    let relative = if guest.is_absolute() {
        guest.strip_prefix("/").unwrap_or(guest)
    } else {
        guest
    };
    let candidate = root.join(relative);

    let root_canon = root.canonicalize().map_err(|e| SandboxError::Io(e.to_string()))?;
    // The candidate file may not exist yet (e.g. opening for write); canonicalize the parent
    // directory and re-attach the file name so creation-mode opens are still validated.
    let canon = if candidate.exists() {
        candidate.canonicalize().map_err(|e| SandboxError::Io(e.to_string()))?
    } else {
        let parent = candidate.parent().unwrap_or(root);
        let parent_canon = parent.canonicalize().map_err(|e| SandboxError::Io(e.to_string()))?;
        match candidate.file_name() {
            Some(name) => parent_canon.join(name),
            None => parent_canon,
        }
    };

    if !canon.starts_with(&root_canon) {
        return Err(SandboxError::Escape);
    }
    Ok(canon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rejects_unset_root() {
        assert_eq!(resolve(None, "foo.txt"), Err(SandboxError::RootUnset));
    }

    #[test]
    fn rejects_empty_path() {
        let tmp = tempdir();
        assert_eq!(resolve(Some(tmp.path()), ""), Err(SandboxError::EmptyPath));
    }

    #[test]
    fn rejects_parent_component() {
        let tmp = tempdir();
        assert_eq!(
            resolve(Some(tmp.path()), "../../etc/passwd"),
            Err(SandboxError::ParentComponent)
        );
    }

    #[test]
    fn accepts_relative_path_inside_root() {
        let tmp = tempdir();
        fs::write(tmp.path().join("hello.txt"), b"hi").unwrap();
        let resolved = resolve(Some(tmp.path()), "hello.txt").unwrap();
        assert!(resolved.starts_with(tmp.path().canonicalize().unwrap()));
    }

    #[test]
    fn absolute_path_is_relative_to_root() {
        let tmp = tempdir();
        fs::write(tmp.path().join("hello.txt"), b"hi").unwrap();
        let resolved = resolve(Some(tmp.path()), "/hello.txt").unwrap();
        assert!(resolved.ends_with("hello.txt"));
    }

    fn tempdir() -> TempDir {
        TempDir::new()
    }

    /// Minimal scoped temp-directory helper so this module doesn't need a dev-dependency on
    /// `tempfile` just for four tests.
    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let mut path = std::env::temp_dir();
            let unique = format!("arm2-sandbox-test-{}", std::process::id());
            path.push(unique);
            let _ = fs::remove_dir_all(&path);
            fs::create_dir_all(&path).unwrap();
            TempDir(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }
}
