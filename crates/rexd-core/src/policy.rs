//! Workspace path policy
//!
//! Lexical canonicalization plus containment checks. Every externally
//! supplied path is resolved against a session cwd and rejected unless the
//! cleaned result lives under one of the configured roots. The resolver does
//! not follow symlinks; containment is decided on the textual path.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Immutable path policy shared by the dispatcher and the services.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    allowed_roots: Vec<PathBuf>,
    allow_shell: bool,
}

impl PolicyEngine {
    /// Build an engine from configured roots. Relative roots are anchored at
    /// the daemon's working directory; all roots are stored lexically
    /// cleaned.
    pub fn new(roots: &[PathBuf], allow_shell: bool) -> Result<Self> {
        let mut allowed_roots = Vec::with_capacity(roots.len());
        for root in roots {
            let abs = if root.is_absolute() {
                root.clone()
            } else {
                std::env::current_dir()?.join(root)
            };
            allowed_roots.push(clean_path(&abs));
        }
        Ok(Self {
            allowed_roots,
            allow_shell,
        })
    }

    /// The cleaned allowed roots, in configuration order.
    #[must_use]
    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed_roots
    }

    /// Whether shell-mode commands (`sh -lc <command>`) may be invoked.
    #[must_use]
    pub fn allow_shell(&self) -> bool {
        self.allow_shell
    }

    /// Join `input` onto `cwd` when relative, lexically clean, and verify
    /// containment. Returns the cleaned absolute path.
    pub fn resolve(&self, cwd: &Path, input: &str) -> Result<PathBuf> {
        let candidate = if Path::new(input).is_absolute() {
            PathBuf::from(input)
        } else {
            cwd.join(input)
        };
        let cleaned = clean_path(&candidate);
        if !self.is_allowed(&cleaned) {
            return Err(Error::ForbiddenPath);
        }
        Ok(cleaned)
    }

    /// Containment predicate without the join step. Fail-closed when no
    /// roots are configured.
    #[must_use]
    pub fn is_allowed(&self, path: &Path) -> bool {
        if self.allowed_roots.is_empty() {
            return false;
        }
        let cleaned = clean_path(path);
        self.allowed_roots
            .iter()
            .any(|root| cleaned == *root || cleaned.starts_with(root))
    }
}

/// Lexically clean a path: drop `.` components and resolve `..` against the
/// preceding component without touching the filesystem.
#[must_use]
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push(Component::RootDir),
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // "/.." stays at the root; a leading ".." on a relative
                // path is preserved.
                if !out.pop() && !out.has_root() {
                    out.push(Component::ParentDir);
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(Component::CurDir);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(roots: &[&str]) -> PolicyEngine {
        let roots: Vec<PathBuf> = roots.iter().map(PathBuf::from).collect();
        PolicyEngine::new(&roots, true).unwrap()
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(Path::new("/a/b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean_path(Path::new("/a/./b/")), PathBuf::from("/a/b"));
        assert_eq!(clean_path(Path::new("/a/../..")), PathBuf::from("/"));
        assert_eq!(clean_path(Path::new("/")), PathBuf::from("/"));
    }

    #[test]
    fn test_resolve_relative_inside_root() {
        let pol = engine(&["/tmp/w"]);
        let resolved = pol.resolve(Path::new("/tmp/w"), "sub/file.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/w/sub/file.txt"));
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let pol = engine(&["/tmp/w"]);
        let err = pol.resolve(Path::new("/tmp/w"), "../etc/passwd").unwrap_err();
        assert!(matches!(err, Error::ForbiddenPath));
    }

    #[test]
    fn test_resolve_rejects_dotdot_through_root() {
        let pol = engine(&["/tmp/w"]);
        let err = pol
            .resolve(Path::new("/tmp/w"), "/tmp/w/../../etc/passwd")
            .unwrap_err();
        assert!(matches!(err, Error::ForbiddenPath));
    }

    #[test]
    fn test_root_itself_is_allowed() {
        let pol = engine(&["/tmp/w"]);
        assert!(pol.is_allowed(Path::new("/tmp/w")));
        assert!(pol.is_allowed(Path::new("/tmp/w/")));
    }

    #[test]
    fn test_sibling_prefix_is_rejected() {
        // "/tmp/work" shares a string prefix with "/tmp/w" but is outside.
        let pol = engine(&["/tmp/w"]);
        assert!(!pol.is_allowed(Path::new("/tmp/work")));
    }

    #[test]
    fn test_empty_roots_fail_closed() {
        let pol = engine(&[]);
        assert!(!pol.is_allowed(Path::new("/")));
        assert!(!pol.is_allowed(Path::new("/tmp")));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let pol = engine(&["/tmp/w"]);
        let once = pol.resolve(Path::new("/tmp/w"), "a/../b/c.txt").unwrap();
        let twice = pol
            .resolve(Path::new("/tmp/w"), once.to_str().unwrap())
            .unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_multiple_roots() {
        let pol = engine(&["/tmp/a", "/tmp/b"]);
        assert!(pol.is_allowed(Path::new("/tmp/a/x")));
        assert!(pol.is_allowed(Path::new("/tmp/b/y")));
        assert!(!pol.is_allowed(Path::new("/tmp/c/z")));
    }
}
