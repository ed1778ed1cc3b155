use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;
use regex::Regex;

use crate::policy::SandboxPolicy;
use crate::types::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Edit,
}

impl AccessMode {
    pub fn is_mutation(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::Edit)
    }
}

/// A rejected path, with the canonical kind reported to the model and a
/// detail string for the operator and audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct PathDenied {
    pub kind: ErrorKind,
    pub detail: String,
}

impl PathDenied {
    fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        PathDenied {
            kind,
            detail: detail.into(),
        }
    }
}

const NTFS_RESERVED: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

fn sensitive_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\.env$",
            r"(?i)\.env\.\w+$",
            r"(?i)id_rsa",
            r"(?i)id_ed25519",
            r"(?i)id_ecdsa",
            r"(?i)\.pem$",
            r"(?i)\.key$",
            r"(?i)\.p12$",
            r"(?i)\.pfx$",
            r"(?i)secrets\.\w+$",
            r"(?i)credentials",
            r"(?i)\.npmrc$",
            r"(?i)\.netrc$",
            r"(?i)\.pgpass$",
            r"(?i)token",
            r"(?i)api[_-]?key",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static sensitive pattern"))
        .collect()
    })
}

/// True when a file name looks credential-shaped. Reads still succeed;
/// the dispatcher marks the anchored origin and audits the access.
pub fn is_sensitive_file(file_name: &str) -> bool {
    sensitive_patterns().iter().any(|re| re.is_match(file_name))
}

/// Confines every filesystem operation to the allowed directories.
/// Validation always operates on the symlink-resolved path, never the
/// supplied literal.
#[derive(Debug, Clone)]
pub struct PathGuard {
    allowed_dirs: Vec<PathBuf>,
    protected_paths: Vec<PathBuf>,
    blocked_extensions: BTreeSet<String>,
    base_dir: PathBuf,
}

impl PathGuard {
    /// Canonicalizes the allowed directories up front; a missing allowed
    /// dir is a boot configuration error, not a runtime denial.
    pub fn from_policy(policy: &SandboxPolicy, base_dir: &Path) -> anyhow::Result<Self> {
        let base_dir = std::fs::canonicalize(base_dir)
            .with_context(|| format!("canonicalize workdir {}", base_dir.display()))?;
        let mut allowed_dirs = Vec::new();
        for dir in &policy.allowed_dirs {
            let abs = if dir.is_absolute() {
                dir.clone()
            } else {
                base_dir.join(dir)
            };
            let canon = std::fs::canonicalize(&abs)
                .with_context(|| format!("canonicalize allowed dir {}", abs.display()))?;
            allowed_dirs.push(canon);
        }
        if allowed_dirs.is_empty() {
            allowed_dirs.push(base_dir.clone());
        }
        let protected_paths = policy
            .protected_paths
            .iter()
            .map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    base_dir.join(p)
                }
            })
            .map(|p| std::fs::canonicalize(&p).unwrap_or(p))
            .collect();
        Ok(PathGuard {
            allowed_dirs,
            protected_paths,
            blocked_extensions: policy.blocked_write_extensions.clone(),
            base_dir,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn allowed_dirs(&self) -> &[PathBuf] {
        &self.allowed_dirs
    }

    /// Validate a path for the given access mode, returning the canonical
    /// absolute path on success.
    pub fn validate(&self, raw: &str, mode: AccessMode) -> Result<PathBuf, PathDenied> {
        self.reject_hostile_forms(raw)?;
        let resolved = self.canonicalize(raw, mode)?;
        self.check_reserved_name(&resolved)?;

        if !self.is_within_allowed(&resolved) {
            return Err(PathDenied::new(
                ErrorKind::OutsideSandbox,
                format!("path outside allowed directories: {raw}"),
            ));
        }

        if mode.is_mutation() {
            for protected in &self.protected_paths {
                if resolved == *protected || resolved.starts_with(protected) {
                    return Err(PathDenied::new(
                        ErrorKind::Protected,
                        format!("write-denied trust root: {}", resolved.display()),
                    ));
                }
            }
            if let Some(name) = resolved.file_name().and_then(|n| n.to_str()) {
                let lower = name.to_ascii_lowercase();
                if self
                    .blocked_extensions
                    .iter()
                    .any(|ext| lower.ends_with(ext.as_str()))
                {
                    return Err(PathDenied::new(
                        ErrorKind::BlockedExtension,
                        format!("executable file type denied as write target: {name}"),
                    ));
                }
            }
        }

        Ok(resolved)
    }

    /// Confinement-only check used for command path arguments: the path
    /// need not exist, but its resolved location must stay inside the
    /// sandbox.
    pub fn confine(&self, raw: &str) -> Result<PathBuf, PathDenied> {
        self.reject_hostile_forms(raw)?;
        let resolved = self.resolve_with_missing_tail(raw)?;
        if !self.is_within_allowed(&resolved) {
            return Err(PathDenied::new(
                ErrorKind::OutsideSandbox,
                format!("path argument outside allowed directories: {raw}"),
            ));
        }
        Ok(resolved)
    }

    fn is_within_allowed(&self, canon: &Path) -> bool {
        self.allowed_dirs.iter().any(|d| canon.starts_with(d))
    }

    /// UNC paths, device paths, and NTFS alternate data streams are
    /// rejected before any resolution happens.
    fn reject_hostile_forms(&self, raw: &str) -> Result<(), PathDenied> {
        if raw.starts_with("\\\\") {
            return Err(PathDenied::new(
                ErrorKind::OutsideSandbox,
                format!("UNC path not allowed: {raw}"),
            ));
        }
        // A single leading drive-letter colon is tolerated; a colon in any
        // later component is an alternate-data-stream shape.
        let after_drive = raw
            .strip_prefix(|c: char| c.is_ascii_alphabetic())
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(raw);
        if after_drive.contains(':') {
            return Err(PathDenied::new(
                ErrorKind::OutsideSandbox,
                format!("alternate data stream not allowed: {raw}"),
            ));
        }
        Ok(())
    }

    fn check_reserved_name(&self, resolved: &Path) -> Result<(), PathDenied> {
        if let Some(name) = resolved.file_name().and_then(|n| n.to_str()) {
            let stem = name.split('.').next().unwrap_or(name).to_ascii_lowercase();
            if NTFS_RESERVED.contains(&stem.as_str()) {
                return Err(PathDenied::new(
                    ErrorKind::OutsideSandbox,
                    format!("reserved device name not allowed: {name}"),
                ));
            }
        }
        Ok(())
    }

    fn canonicalize(&self, raw: &str, mode: AccessMode) -> Result<PathBuf, PathDenied> {
        let joined = self.join_base(raw);
        match mode {
            AccessMode::Read | AccessMode::Edit => std::fs::canonicalize(&joined).map_err(|e| {
                PathDenied::new(ErrorKind::NotFound, format!("{}: {e}", joined.display()))
            }),
            AccessMode::Write => self.resolve_with_missing_tail(raw),
        }
    }

    /// Resolve a path that may not exist yet: canonicalize the deepest
    /// existing ancestor (following symlinks), then re-attach the missing
    /// tail. The tail may not traverse upward.
    fn resolve_with_missing_tail(&self, raw: &str) -> Result<PathBuf, PathDenied> {
        let joined = self.join_base(raw);
        if let Ok(canon) = std::fs::canonicalize(&joined) {
            return Ok(canon);
        }
        let mut existing = joined.as_path();
        let mut tail: Vec<std::ffi::OsString> = Vec::new();
        loop {
            match existing.parent() {
                Some(parent) => {
                    if let Some(name) = existing.file_name() {
                        tail.push(name.to_os_string());
                    }
                    if parent.exists() {
                        existing = parent;
                        break;
                    }
                    existing = parent;
                }
                None => break,
            }
        }
        for component in &tail {
            if component == ".." {
                return Err(PathDenied::new(
                    ErrorKind::OutsideSandbox,
                    format!("upward traversal in non-existing path: {raw}"),
                ));
            }
        }
        let canon_base = std::fs::canonicalize(existing).map_err(|e| {
            PathDenied::new(ErrorKind::NotFound, format!("{}: {e}", existing.display()))
        })?;
        let mut out = canon_base;
        for component in tail.iter().rev() {
            out.push(component);
        }
        Ok(out)
    }

    fn join_base(&self, raw: &str) -> PathBuf {
        let p = Path::new(raw);
        let mut joined = if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        };
        // Lexically drop `.` components so the ancestor walk behaves.
        joined = joined
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();
        joined
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{is_sensitive_file, AccessMode, PathGuard};
    use crate::policy::SandboxPolicy;
    use crate::types::ErrorKind;

    fn guard_for(dir: &std::path::Path) -> PathGuard {
        let mut policy = SandboxPolicy::with_defaults(vec![dir.to_path_buf()]);
        policy.protected_paths = vec![dir.join("MEMORY.md")];
        PathGuard::from_policy(&policy, dir).expect("guard")
    }

    #[test]
    fn path_outside_sandbox_is_rejected() {
        let tmp = tempdir().expect("tempdir");
        let guard = guard_for(tmp.path());
        let err = guard.validate("/etc/passwd", AccessMode::Read).expect_err("deny");
        assert_eq!(err.kind, ErrorKind::OutsideSandbox);
    }

    #[test]
    fn relative_path_inside_sandbox_resolves() {
        let tmp = tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("a.txt"), "x").expect("write");
        let guard = guard_for(tmp.path());
        let p = guard.validate("a.txt", AccessMode::Read).expect("allow");
        assert!(p.ends_with("a.txt"));
    }

    #[test]
    fn dotdot_escape_is_rejected() {
        let tmp = tempdir().expect("tempdir");
        let guard = guard_for(tmp.path());
        let err = guard
            .validate("../outside.txt", AccessMode::Write)
            .expect_err("deny");
        assert_eq!(err.kind, ErrorKind::OutsideSandbox);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_sandbox_is_rejected() {
        let tmp = tempdir().expect("tempdir");
        let outside = tempdir().expect("outside");
        std::fs::write(outside.path().join("secret.txt"), "s").expect("write");
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), tmp.path().join("link.txt"))
            .expect("symlink");
        let guard = guard_for(tmp.path());
        let err = guard.validate("link.txt", AccessMode::Read).expect_err("deny");
        assert_eq!(err.kind, ErrorKind::OutsideSandbox);
    }

    #[test]
    fn protected_file_denied_for_write_but_not_read() {
        let tmp = tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("MEMORY.md"), "facts").expect("write");
        let guard = guard_for(tmp.path());
        let err = guard.validate("MEMORY.md", AccessMode::Edit).expect_err("deny");
        assert_eq!(err.kind, ErrorKind::Protected);
        guard.validate("MEMORY.md", AccessMode::Read).expect("reads allowed");
    }

    #[test]
    fn blocked_extension_denied_on_write() {
        let tmp = tempdir().expect("tempdir");
        let guard = guard_for(tmp.path());
        let err = guard.validate("run.sh", AccessMode::Write).expect_err("deny");
        assert_eq!(err.kind, ErrorKind::BlockedExtension);
    }

    #[test]
    fn missing_file_read_reports_not_found() {
        let tmp = tempdir().expect("tempdir");
        let guard = guard_for(tmp.path());
        let err = guard.validate("nope.txt", AccessMode::Read).expect_err("deny");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn new_file_write_inside_sandbox_is_allowed() {
        let tmp = tempdir().expect("tempdir");
        let guard = guard_for(tmp.path());
        let p = guard
            .validate("sub/dir/new.txt", AccessMode::Write)
            .expect("allow");
        assert!(p.starts_with(std::fs::canonicalize(tmp.path()).expect("canon")));
    }

    #[test]
    fn hostile_windows_forms_rejected() {
        let tmp = tempdir().expect("tempdir");
        let guard = guard_for(tmp.path());
        assert_eq!(
            guard
                .validate("\\\\server\\share\\f.txt", AccessMode::Read)
                .expect_err("unc")
                .kind,
            ErrorKind::OutsideSandbox
        );
        assert_eq!(
            guard
                .validate("notes.txt:stream", AccessMode::Read)
                .expect_err("ads")
                .kind,
            ErrorKind::OutsideSandbox
        );
        assert_eq!(
            guard.validate("NUL.txt", AccessMode::Write).expect_err("reserved").kind,
            ErrorKind::OutsideSandbox
        );
    }

    #[test]
    fn sensitive_file_names_are_flagged() {
        assert!(is_sensitive_file(".env"));
        assert!(is_sensitive_file(".env.production"));
        assert!(is_sensitive_file("id_rsa"));
        assert!(is_sensitive_file("server.pem"));
        assert!(is_sensitive_file("api_key.json"));
        assert!(!is_sensitive_file("main.rs"));
    }

    #[test]
    fn allowed_dirs_default_to_base() {
        let tmp = tempdir().expect("tempdir");
        let policy = SandboxPolicy::with_defaults(Vec::new());
        let guard = PathGuard::from_policy(&policy, tmp.path()).expect("guard");
        assert_eq!(
            guard.allowed_dirs(),
            &[std::fs::canonicalize(tmp.path()).expect("canon")]
        );
    }
}
