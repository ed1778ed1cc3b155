use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::protocol::{ToolRegistry, ToolSpec};

pub const PLUGIN_LISTING: &str = "tools.json";

/// A plugin descriptor: a renamed view of an existing vetted handler.
/// Plugins never bring code; `alias_of` must name a built-in tool, so a
/// plugin can narrow or re-describe a capability but cannot add one.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginTool {
    pub name: String,
    pub description: String,
    pub alias_of: String,
}

/// Aliases resolved at dispatch time: plugin name → builtin handler name.
pub type PluginAliases = std::collections::BTreeMap<String, String>;

/// Read the listing from an explicitly passed directory. Nothing is ever
/// auto-discovered; without the flag this function is not called.
pub fn load_plugins(
    plugins_dir: &Path,
    registry: &mut ToolRegistry,
) -> anyhow::Result<PluginAliases> {
    let listing = plugins_dir.join(PLUGIN_LISTING);
    let raw = std::fs::read_to_string(&listing)
        .with_context(|| format!("read plugin listing {}", listing.display()))?;
    let tools: Vec<PluginTool> =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", listing.display()))?;

    let mut aliases = PluginAliases::new();
    for tool in tools {
        let Some(base) = registry.get(&tool.alias_of) else {
            bail!(
                "plugin tool '{}' aliases unknown builtin '{}'",
                tool.name,
                tool.alias_of
            );
        };
        let capability = base.capability;
        let (required, optional) = (base.required, base.optional);
        if !tool
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
            || tool.name.is_empty()
        {
            bail!("invalid plugin tool name: '{}'", tool.name);
        }
        registry.register(ToolSpec {
            name: Box::leak(tool.name.clone().into_boxed_str()),
            capability,
            description: Box::leak(tool.description.into_boxed_str()),
            required,
            optional,
        })?;
        aliases.insert(tool.name, tool.alias_of);
    }
    Ok(aliases)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{load_plugins, PLUGIN_LISTING};
    use crate::protocol::ToolRegistry;
    use crate::tools::register_builtin_tools;

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        register_builtin_tools(&mut reg).expect("builtins");
        reg
    }

    #[test]
    fn aliases_register_against_existing_builtins() {
        let tmp = tempdir().expect("tempdir");
        std::fs::write(
            tmp.path().join(PLUGIN_LISTING),
            r#"[{"name": "read_source", "description": "Read source files", "alias_of": "file_read"}]"#,
        )
        .expect("write");
        let mut reg = registry();
        let aliases = load_plugins(tmp.path(), &mut reg).expect("load");
        assert_eq!(aliases.get("read_source").map(String::as_str), Some("file_read"));
        assert!(reg.get("read_source").is_some());
    }

    #[test]
    fn unknown_alias_target_is_a_boot_error() {
        let tmp = tempdir().expect("tempdir");
        std::fs::write(
            tmp.path().join(PLUGIN_LISTING),
            r#"[{"name": "pwn", "description": "x", "alias_of": "spawn_anything"}]"#,
        )
        .expect("write");
        assert!(load_plugins(tmp.path(), &mut registry()).is_err());
    }

    #[test]
    fn missing_listing_is_a_boot_error() {
        let tmp = tempdir().expect("tempdir");
        assert!(load_plugins(tmp.path(), &mut registry()).is_err());
    }
}
