// SPDX-License-Identifier: MIT
//! Workspace path resolution.
//!
//! Every client-supplied path funnels through here: separators normalized,
//! `.`/`..` resolved, symlinks rejected unless enabled, and the result must
//! stay under the workspace root.

use std::path::{Component, Path, PathBuf};

use crate::error::ServiceError;

#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    allow_symlinks: bool,
    deny: Vec<String>,
}

impl PathResolver {
    pub fn new(root: PathBuf, allow_symlinks: bool, deny: Vec<String>) -> Self {
        Self {
            root: normalize_path(&root),
            allow_symlinks,
            deny,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client path to an absolute workspace path.
    ///
    /// Relative paths are joined onto the root; absolute paths are accepted
    /// only when they already lie under it.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ServiceError> {
        let cleaned = raw.replace('\\', "/");
        let cleaned = cleaned.trim();
        if cleaned.contains('\0') {
            return Err(ServiceError::Malformed("path contains NUL".into()));
        }

        let candidate = Path::new(cleaned);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let resolved = normalize_path(&joined);

        if !resolved.starts_with(&self.root) {
            return Err(ServiceError::Refused(format!(
                "PathOutsideWorkspace: {raw}"
            )));
        }

        for needle in &self.deny {
            if resolved.to_string_lossy().contains(needle.as_str()) {
                return Err(ServiceError::Refused(format!("PathDenied: {raw}")));
            }
        }

        if !self.allow_symlinks {
            self.reject_symlinks(&resolved)?;
        }

        Ok(resolved)
    }

    /// Walk the existing prefix of `path` and refuse any symlink component.
    fn reject_symlinks(&self, path: &Path) -> Result<(), ServiceError> {
        let mut current = self.root.clone();
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        for component in rel.components() {
            current.push(component);
            match std::fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(ServiceError::Refused(format!(
                        "PathDenied: symlink at {}",
                        current.display()
                    )));
                }
                // Path not created yet — nothing further can be a symlink.
                Err(_) => break,
                Ok(_) => {}
            }
        }
        Ok(())
    }
}

/// Resolve `.` and `..` components without touching the filesystem
/// (unlike `std::fs::canonicalize`, this works for paths that do not
/// exist yet).
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if matches!(components.last(), Some(Component::Normal(_))) {
                    components.pop();
                }
                // Ignore .. at root
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(dir: &Path) -> PathResolver {
        PathResolver::new(dir.to_path_buf(), false, vec![".ssh".into()])
    }

    #[test]
    fn normalize_resolves_dots() {
        assert_eq!(normalize_path(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize_path(Path::new("/../x")), PathBuf::from("/x"));
    }

    #[test]
    fn relative_path_joins_root() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let p = r.resolve("src/main.rs").unwrap();
        assert!(p.starts_with(dir.path()));
        assert!(p.ends_with("src/main.rs"));
    }

    #[test]
    fn traversal_is_outside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let err = r.resolve("../../etc/passwd").unwrap_err();
        assert!(err.wire_message().contains("PathOutsideWorkspace"), "{err}");
    }

    #[test]
    fn foreign_absolute_path_refused() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        assert!(r.resolve("/etc/passwd").is_err());
        // An absolute path inside the root is fine.
        let inside = dir.path().join("ok.txt");
        assert!(r.resolve(inside.to_str().unwrap()).is_ok());
    }

    #[test]
    fn deny_list_matches_substring() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let err = r.resolve(".ssh/id_rsa").unwrap_err();
        assert!(err.wire_message().contains("PathDenied"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_component_refused() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let r = resolver(dir.path());
        assert!(r.resolve("link/file.txt").is_err());

        let permissive = PathResolver::new(dir.path().to_path_buf(), true, vec![]);
        assert!(permissive.resolve("link/file.txt").is_ok());
    }

    #[test]
    fn backslashes_normalize() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let p = r.resolve("src\\lib.rs").unwrap();
        assert!(p.ends_with("src/lib.rs"));
    }

    proptest::proptest! {
        // Whatever the client sends, an accepted path stays under the root.
        #[test]
        fn accepted_paths_stay_under_root(raw in "[a-zA-Z0-9._/-]{0,48}") {
            let root = PathBuf::from("/ws/root");
            let r = PathResolver::new(root.clone(), true, vec![]);
            if let Ok(resolved) = r.resolve(&raw) {
                proptest::prop_assert!(resolved.starts_with(&root));
            }
        }
    }
}
