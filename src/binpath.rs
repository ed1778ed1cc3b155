use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::bail;

/// Absolute-path registry for spawned binaries.
///
/// PATH is read exactly once at boot and every binary the runtime will
/// ever spawn is resolved to an absolute path up front, so a PATH change
/// after boot cannot redirect a spawn.
#[derive(Debug, Clone)]
pub struct BinPathRegistry {
    resolved: BTreeMap<String, PathBuf>,
    search_dirs: Vec<PathBuf>,
    warnings: Vec<String>,
}

/// Binaries required for core functionality; boot fails without them.
const REQUIRED: &[&str] = &["git"];
/// Useful but not mandatory; a missing one only produces a warning.
const OPTIONAL: &[&str] = &["python", "python3", "node"];

impl BinPathRegistry {
    /// Resolve required and optional binaries against the boot-time PATH.
    pub fn resolve_at_boot() -> anyhow::Result<Self> {
        let search_dirs: Vec<PathBuf> = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        let mut registry = BinPathRegistry {
            resolved: BTreeMap::new(),
            search_dirs,
            warnings: Vec::new(),
        };

        let mut missing = Vec::new();
        for name in REQUIRED {
            match registry.search(name) {
                Some(path) => {
                    registry.resolved.insert((*name).to_string(), path);
                }
                None => missing.push(*name),
            }
        }
        if !missing.is_empty() {
            bail!("required binaries not found on PATH: {}", missing.join(", "));
        }
        for name in OPTIONAL {
            match registry.search(name) {
                Some(path) => {
                    registry.resolved.insert((*name).to_string(), path);
                }
                None => registry
                    .warnings
                    .push(format!("optional binary '{name}' not found on PATH")),
            }
        }
        Ok(registry)
    }

    /// Registry over explicit directories; used by tests.
    pub fn with_search_dirs(search_dirs: Vec<PathBuf>) -> Self {
        BinPathRegistry {
            resolved: BTreeMap::new(),
            search_dirs,
            warnings: Vec::new(),
        }
    }

    /// Absolute path for a command name, resolving against the boot-time
    /// snapshot when the name was not pre-registered.
    pub fn lookup(&self, name: &str) -> Option<PathBuf> {
        if let Some(path) = self.resolved.get(name) {
            return Some(path.clone());
        }
        self.search(name)
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.resolved.get(name).map(PathBuf::as_path)
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// The directories PATH held at boot; re-pinned into the sanitized
    /// child environment so spawned tools see the same world.
    pub fn boot_path_value(&self) -> std::ffi::OsString {
        std::env::join_paths(self.search_dirs.iter()).unwrap_or_default()
    }

    fn search(&self, name: &str) -> Option<PathBuf> {
        for dir in &self.search_dirs {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                return std::fs::canonicalize(&candidate).ok();
            }
            if cfg!(windows) {
                let exe = dir.join(format!("{name}.exe"));
                if exe.is_file() {
                    return std::fs::canonicalize(&exe).ok();
                }
            }
        }
        None
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
