use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::policy::SandboxPolicy;

pub const CONFIG_FILENAME: &str = ".warden.json";

/// Optional project/user configuration. CLI flags override these values;
/// these override the built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub allow_dirs: Vec<PathBuf>,
    pub protected_paths: Vec<PathBuf>,
    pub trust_roots: Vec<PathBuf>,
    pub command_allowlist_extra: Vec<String>,
    pub command_blocklist_extra: Vec<String>,
    pub max_read_lines: Option<usize>,
    pub command_timeout_secs: Option<u64>,
}

/// Search order: project directory, then the home directory.
pub fn find_config_file(workdir: &Path) -> Option<PathBuf> {
    let project = workdir.join(CONFIG_FILENAME);
    if project.is_file() {
        return Some(project);
    }
    let home = std::env::var_os("HOME").map(PathBuf::from)?;
    let user = home.join(CONFIG_FILENAME);
    user.is_file().then_some(user)
}

pub fn load_config(path: &Path) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
}

/// Fold file-level settings into the policy. Extra allowlist entries are
/// dropped when the blocklist already names them; the blocklist always
/// shadows.
pub fn apply_config(policy: &mut SandboxPolicy, config: &FileConfig) {
    policy.allowed_dirs.extend(config.allow_dirs.iter().cloned());
    policy
        .protected_paths
        .extend(config.protected_paths.iter().cloned());
    for cmd in &config.command_blocklist_extra {
        policy.command_blocklist.insert(cmd.clone());
        policy.command_allowlist.remove(cmd);
    }
    for cmd in &config.command_allowlist_extra {
        if !policy.command_blocklist.contains(cmd) {
            policy.command_allowlist.insert(cmd.clone());
        }
    }
    if let Some(lines) = config.max_read_lines {
        policy.max_read_lines = lines;
    }
    if let Some(secs) = config.command_timeout_secs {
        policy.command_timeout_secs = secs;
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{apply_config, find_config_file, load_config, FileConfig, CONFIG_FILENAME};
    use crate::policy::SandboxPolicy;

    #[test]
    fn project_config_wins_over_home() {
        let tmp = tempdir().expect("tempdir");
        std::fs::write(tmp.path().join(CONFIG_FILENAME), "{}").expect("write");
        let found = find_config_file(tmp.path()).expect("found");
        assert_eq!(found, tmp.path().join(CONFIG_FILENAME));
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join(CONFIG_FILENAME);
        std::fs::write(&path, r#"{"endpoit": "typo"}"#).expect("write");
        assert!(load_config(&path).is_err());
        std::fs::write(&path, r#"{"endpoint": "http://127.0.0.1:9999", "command_blocklist_extra": ["perl"]}"#)
            .expect("write");
        let config = load_config(&path).expect("valid");
        assert_eq!(config.endpoint.as_deref(), Some("http://127.0.0.1:9999"));
    }

    #[test]
    fn blocklist_extras_shadow_allowlist_extras() {
        let mut policy = SandboxPolicy::with_defaults(vec![]);
        let config = FileConfig {
            command_allowlist_extra: vec!["perl".into(), "ruby".into()],
            command_blocklist_extra: vec!["perl".into(), "echo".into()],
            max_read_lines: Some(100),
            ..FileConfig::default()
        };
        apply_config(&mut policy, &config);
        assert!(!policy.command_allowlist.contains("perl"));
        assert!(policy.command_allowlist.contains("ruby"));
        assert!(!policy.command_allowlist.contains("echo"));
        assert!(policy.command_blocklist.contains("echo"));
        assert_eq!(policy.max_read_lines, 100);
    }
}
