//! Loaded plugins in registration order, and the command table
//!
//! Registration order is the order plugins were loaded; the core command
//! handler is always first. It decides the order hooks are called in and
//! which plugin keeps a command name both claim.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::context::PluginContext;
use super::health::{HealthSnapshot, HookStats};
use super::plugin::{Capabilities, Capability, Plugin, PluginMetadata};

/// A plugin that is loaded and receiving dispatch
pub struct LoadedPlugin {
    /// Static description
    pub metadata: PluginMetadata,
    /// Declared hooks
    pub capabilities: Capabilities,
    /// Commands the plugin declared
    pub commands: BTreeMap<String, String>,
    /// Plugin directory
    pub dir: PathBuf,
    /// The instance
    pub plugin: Arc<dyn Plugin>,
    /// Its context
    pub context: PluginContext,
    /// Breaker statistics
    pub stats: Arc<HookStats>,
}

impl LoadedPlugin {
    /// Plugin identifier
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Whether dispatch should call `cap` on this plugin
    pub fn accepts(&self, cap: Capability) -> bool {
        self.capabilities.has(cap) && !self.stats.is_disabled()
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("id", &self.metadata.id)
            .field("capabilities", &self.capabilities)
            .field("disabled", &self.stats.is_disabled())
            .finish()
    }
}

/// A command and the plugin that answers it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandEntry {
    /// Command name
    pub name: String,
    /// Help text
    pub description: String,
    /// Owning plugin
    pub owner: String,
}

/// Status of a loaded plugin
#[derive(Debug, Clone, Serialize)]
pub struct LoadedStatus {
    /// Description
    pub metadata: PluginMetadata,
    /// Declared hooks
    pub capabilities: Vec<Capability>,
    /// Commands the plugin owns
    pub commands: Vec<String>,
    /// Breaker statistics
    pub health: HealthSnapshot,
}

#[derive(Default)]
struct RegistryInner {
    plugins: Vec<Arc<LoadedPlugin>>,
    commands: BTreeMap<String, CommandEntry>,
}

/// Shared registration table
#[derive(Clone, Default)]
pub struct PluginRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl PluginRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin and claim its commands.
    ///
    /// Returns the command names lost to earlier registrations.
    pub fn insert(&self, plugin: Arc<LoadedPlugin>) -> Vec<String> {
        let mut inner = self.inner.write();
        let mut collisions = Vec::new();
        for (name, description) in &plugin.commands {
            let name = name.to_lowercase();
            if let Some(existing) = inner.commands.get(&name) {
                warn!(
                    command = %name,
                    plugin = %plugin.id(),
                    owner = %existing.owner,
                    "Command already registered; keeping first registration"
                );
                collisions.push(name);
                continue;
            }
            inner.commands.insert(
                name.clone(),
                CommandEntry {
                    name,
                    description: description.clone(),
                    owner: plugin.id().to_string(),
                },
            );
        }
        info!(plugin = %plugin.id(), position = inner.plugins.len(), "Plugin registered");
        inner.plugins.push(plugin);
        collisions
    }

    /// Remove a plugin and release its commands.
    ///
    /// A released name passes to the earliest remaining plugin that
    /// declares it.
    pub fn remove(&self, id: &str) -> Option<Arc<LoadedPlugin>> {
        let mut inner = self.inner.write();
        let pos = inner.plugins.iter().position(|p| p.id() == id)?;
        let plugin = inner.plugins.remove(pos);
        inner.commands.retain(|_, entry| entry.owner != id);

        let RegistryInner { plugins, commands } = &mut *inner;
        for name in plugin.commands.keys().map(|n| n.to_lowercase()) {
            if commands.contains_key(&name) {
                continue;
            }
            let heir = plugins.iter().find_map(|p| {
                p.commands
                    .iter()
                    .find(|(declared, _)| declared.to_lowercase() == name)
                    .map(|(_, description)| (p.id().to_string(), description.clone()))
            });
            if let Some((owner, description)) = heir {
                info!(command = %name, plugin = %owner, released_by = %id, "Command ownership passed on");
                commands.insert(
                    name.clone(),
                    CommandEntry {
                        name,
                        description,
                        owner,
                    },
                );
            }
        }
        Some(plugin)
    }

    /// Look up a loaded plugin
    pub fn get(&self, id: &str) -> Option<Arc<LoadedPlugin>> {
        self.inner.read().plugins.iter().find(|p| p.id() == id).cloned()
    }

    /// Whether `id` is loaded
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Loaded plugins in registration order
    pub fn snapshot(&self) -> Vec<Arc<LoadedPlugin>> {
        self.inner.read().plugins.clone()
    }

    /// Ids in registration order
    pub fn ids(&self) -> Vec<String> {
        self.inner.read().plugins.iter().map(|p| p.id().to_string()).collect()
    }

    /// Plugin owning `command`
    pub fn command_owner(&self, command: &str) -> Option<String> {
        self.inner
            .read()
            .commands
            .get(&command.to_lowercase())
            .map(|entry| entry.owner.clone())
    }

    /// Every registered command, sorted by name
    pub fn catalogue(&self) -> Vec<CommandEntry> {
        self.inner.read().commands.values().cloned().collect()
    }

    /// Status of every loaded plugin
    pub fn status(&self) -> Vec<LoadedStatus> {
        let inner = self.inner.read();
        inner
            .plugins
            .iter()
            .map(|p| LoadedStatus {
                metadata: p.metadata.clone(),
                capabilities: p.capabilities.list(),
                commands: inner
                    .commands
                    .values()
                    .filter(|c| c.owner == p.id())
                    .map(|c| c.name.clone())
                    .collect(),
                health: p.stats.snapshot(),
            })
            .collect()
    }

    /// Number of loaded plugins
    pub fn len(&self) -> usize {
        self.inner.read().plugins.len()
    }

    /// Whether nothing is loaded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.ids())
            .finish()
    }
}
