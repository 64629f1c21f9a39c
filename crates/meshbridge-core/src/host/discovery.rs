//! Plugin discovery
//!
//! Each plugin lives in its own subdirectory of the plugin root:
//!
//! ```text
//! plugins/
//!   _template/        skipped (template prefix)
//!   message_log/
//!     config.json     { "enabled": true, ... }
//!   beacon/
//!     config.json
//! ```
//!
//! A directory becomes a plugin when the process has an implementation
//! registered under the directory name and the directory holds a
//! `config.json` object with a boolean `enabled` flag.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::context::PLUGIN_CONFIG_FILE;
use super::plugin::{Capabilities, PluginCatalog, PluginMetadata};
use crate::error::{BridgeError, Result};
use crate::persist;

/// A plugin found on disk
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    /// Directory name, used as the plugin id
    pub id: String,
    /// Plugin directory
    pub dir: PathBuf,
    /// Contents of `config.json`
    pub config: serde_json::Value,
    /// The `enabled` flag
    pub enabled: bool,
    /// Metadata reported by the implementation
    pub metadata: PluginMetadata,
    /// Declared hooks
    pub capabilities: Capabilities,
    /// Declared commands
    pub commands: BTreeMap<String, String>,
}

/// A directory that was not accepted as a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDir {
    /// Directory name
    pub name: String,
    /// Why it was skipped
    pub reason: String,
}

/// Outcome of a scan
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Accepted plugins, sorted by id
    pub plugins: Vec<DiscoveredPlugin>,
    /// Rejected directories
    pub skipped: Vec<SkippedDir>,
}

/// Scan `root` for plugin directories.
///
/// A missing root is not an error; it yields an empty report.
pub async fn scan(root: &Path, template_prefix: &str, catalog: &PluginCatalog) -> Result<DiscoveryReport> {
    let mut report = DiscoveryReport::default();

    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(root = %root.display(), "Plugin root does not exist");
            return Ok(report);
        }
        Err(e) => return Err(e.into()),
    };

    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    dirs.sort();

    for (name, dir) in dirs {
        if name.starts_with('.') || (!template_prefix.is_empty() && name.starts_with(template_prefix)) {
            debug!(dir = %name, "Skipping template directory");
            continue;
        }

        match inspect(&name, &dir, catalog).await {
            Ok(plugin) => {
                debug!(plugin = %plugin.id, enabled = plugin.enabled, "Discovered plugin");
                report.plugins.push(plugin);
            }
            Err(e) => {
                warn!(dir = %name, error = %e, "Skipping plugin directory");
                report.skipped.push(SkippedDir {
                    name,
                    reason: e.to_string(),
                });
            }
        }
    }

    info!(
        root = %root.display(),
        found = report.plugins.len(),
        skipped = report.skipped.len(),
        "Plugin discovery complete"
    );
    Ok(report)
}

async fn inspect(name: &str, dir: &Path, catalog: &PluginCatalog) -> Result<DiscoveredPlugin> {
    let instance = catalog
        .create(name)
        .ok_or_else(|| BridgeError::NoImplementation(name.to_string()))?;

    let config: serde_json::Value = persist::read_json(&dir.join(PLUGIN_CONFIG_FILE))
        .await?
        .ok_or_else(|| BridgeError::MissingConfig(format!("{}/{}", name, PLUGIN_CONFIG_FILE)))?;

    let enabled = config
        .as_object()
        .and_then(|obj| obj.get("enabled"))
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| {
            BridgeError::InvalidConfig(format!(
                "{}/{} must be an object with a boolean `enabled`",
                name, PLUGIN_CONFIG_FILE
            ))
        })?;

    let mut metadata = instance.metadata();
    if metadata.id != name {
        warn!(dir = %name, reported = %metadata.id, "Plugin id differs from directory name; using directory name");
        metadata.id = name.to_string();
    }

    Ok(DiscoveredPlugin {
        id: name.to_string(),
        dir: dir.to_path_buf(),
        config,
        enabled,
        metadata,
        capabilities: instance.capabilities(),
        commands: instance.commands(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{write_plugin_dir, RecordingPlugin};

    fn catalog() -> PluginCatalog {
        PluginCatalog::new()
            .with("alpha", || RecordingPlugin::new("alpha"))
            .with("beta", || RecordingPlugin::new("beta"))
            .with("_template", || RecordingPlugin::new("_template"))
    }

    #[tokio::test]
    async fn test_scan_filters_and_sorts() {
        let root = tempfile::tempdir().unwrap();
        write_plugin_dir(root.path(), "beta", serde_json::json!({ "enabled": false })).unwrap();
        write_plugin_dir(root.path(), "alpha", serde_json::json!({ "enabled": true, "x": 1 })).unwrap();
        write_plugin_dir(root.path(), "_template", serde_json::json!({ "enabled": true })).unwrap();
        write_plugin_dir(root.path(), "unknown", serde_json::json!({ "enabled": true })).unwrap();
        write_plugin_dir(root.path(), ".hidden", serde_json::json!({ "enabled": true })).unwrap();
        std::fs::create_dir_all(root.path().join("noconfig")).unwrap();

        let report = scan(root.path(), "_", &catalog()).await.unwrap();
        let ids: Vec<&str> = report.plugins.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
        assert!(report.plugins[0].enabled);
        assert!(!report.plugins[1].enabled);
        assert_eq!(report.plugins[0].config["x"], 1);

        let skipped: Vec<&str> = report.skipped.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(skipped, vec!["noconfig", "unknown"]);
    }

    #[tokio::test]
    async fn test_enabled_flag_required() {
        let root = tempfile::tempdir().unwrap();
        write_plugin_dir(root.path(), "alpha", serde_json::json!({ "name": "x" })).unwrap();
        write_plugin_dir(root.path(), "beta", serde_json::json!({ "enabled": "yes" })).unwrap();
        let report = scan(root.path(), "_", &catalog()).await.unwrap();
        assert!(report.plugins.is_empty());
        assert_eq!(report.skipped.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let report = scan(&root.path().join("nope"), "_", &catalog()).await.unwrap();
        assert!(report.plugins.is_empty());
    }
}
