//! Extension host
//!
//! Discovers plugins on disk, loads and unloads them, and keeps the
//! [`PluginRegistry`] the dispatcher reads from. All lifecycle operations
//! are serialized; dispatch keeps running while they happen and simply
//! sees the registry before or after the change.
//!
//! # Lifecycle
//!
//! ```text
//! discover ──► load ──► (dispatch) ──► unload
//!                ▲                       │
//!                └──── reload_all ◄──────┘
//! ```
//!
//! Unload cancels the plugin's context first, so a poller mid-sleep wakes
//! and stops and any later send is refused. The teardown hook and
//! background tasks are then given `unload_timeout`; anything still
//! running after that is abandoned.

pub mod context;
pub mod discovery;
pub mod health;
pub mod plugin;
pub mod registry;
pub mod routes;

pub use context::{HostInfo, PluginContext, SendOutcome, PLUGIN_CONFIG_FILE};
pub use discovery::{DiscoveredPlugin, DiscoveryReport, SkippedDir};
pub use health::{HealthSnapshot, HookKind, HookLimits, HookStats};
pub use plugin::{
    Capabilities, Capability, EmergencyAlert, MessageEvent, Plugin, PluginCatalog, PluginFactory,
    PluginMetadata,
};
pub use registry::{CommandEntry, LoadedPlugin, LoadedStatus, PluginRegistry};
pub use routes::{Method, RouteInfo, RouteRegistrar, RouteTable, WebhookRequest, WebhookResponse};

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, PluginHostConfig};
use crate::error::{BridgeError, Result};
use crate::persist;
use crate::scheduler::OutboundScheduler;
use health::guarded_call;

/// Registration record reported by discovery and status queries
#[derive(Debug, Clone, Serialize)]
pub struct PluginRegistration {
    /// Identifier
    pub id: String,
    /// Human-readable name
    pub display_name: String,
    /// Version
    pub version: String,
    /// Description
    pub description: String,
    /// `enabled` flag from the plugin configuration
    pub enabled: bool,
    /// Currently loaded
    pub loaded: bool,
    /// Disabled by the failure breaker
    pub faulted: bool,
    /// Part of the bridge rather than discovered on disk
    pub builtin: bool,
    /// Declared hooks
    pub capabilities: Vec<Capability>,
    /// Declared commands
    pub commands: BTreeMap<String, String>,
}

/// Host status for the status surface
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    /// Known plugins: loaded, available but disabled, faulted
    pub plugins: Vec<PluginRegistration>,
    /// Command catalogue
    pub commands: Vec<CommandEntry>,
    /// Webhook routes
    pub routes: Vec<RouteInfo>,
    /// Directories rejected by the last discovery
    pub skipped: Vec<String>,
}

/// The extension host
pub struct ExtensionHost {
    config: PluginHostConfig,
    catalog: PluginCatalog,
    scheduler: OutboundScheduler,
    host_info: HostInfo,
    registry: PluginRegistry,
    routes: RouteTable,
    discovered: RwLock<BTreeMap<String, DiscoveredPlugin>>,
    skipped: RwLock<Vec<SkippedDir>>,
    builtins: RwLock<BTreeSet<String>>,
    lifecycle: tokio::sync::Mutex<()>,
}

/// Parent of the built-in plugins' private directories, under the plugin root
pub const BUILTIN_DIR: &str = ".builtin";

impl ExtensionHost {
    /// Create a host. Nothing is discovered or loaded yet.
    pub fn new(config: &BridgeConfig, catalog: PluginCatalog, scheduler: OutboundScheduler) -> Self {
        let host_info = HostInfo {
            node_name: config.node.name.clone(),
            alias_suffix: config.commands.alias().to_string(),
            machine_marker: config.loop_prevention.machine_marker.clone(),
            plugin_root: config.plugins.root.clone(),
        };
        Self {
            config: config.plugins.clone(),
            catalog,
            scheduler,
            host_info,
            registry: PluginRegistry::new(),
            routes: RouteTable::new(),
            discovered: RwLock::new(BTreeMap::new()),
            skipped: RwLock::new(Vec::new()),
            builtins: RwLock::new(BTreeSet::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Registry read by the dispatcher
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Webhook routes
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Limits applied to hook calls
    pub fn limits(&self) -> HookLimits {
        HookLimits {
            timeout: self.config.hook_timeout,
            failure_threshold: self.config.failure_threshold,
        }
    }

    /// Host settings visible to plugins
    pub fn host_info(&self) -> &HostInfo {
        &self.host_info
    }

    /// Configured plugin root
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Load a plugin that is part of the bridge itself. Built-ins are
    /// registered before discovered plugins and survive `reload_all`.
    ///
    /// Each built-in gets `<root>/.builtin/<id>` as its directory, which
    /// discovery never scans.
    pub async fn register_builtin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let id = plugin.metadata().id;
        let dir = self.config.root.join(BUILTIN_DIR).join(&id);
        self.activate(&id, plugin, dir, serde_json::json!({ "enabled": true }))
            .await?;
        self.builtins.write().insert(id);
        Ok(())
    }

    /// Scan `root` (or the configured root) and remember what was found
    pub async fn discover(&self, root: Option<&Path>) -> Result<Vec<PluginRegistration>> {
        let _guard = self.lifecycle.lock().await;
        self.discover_inner(root).await
    }

    async fn discover_inner(&self, root: Option<&Path>) -> Result<Vec<PluginRegistration>> {
        let root = root.unwrap_or(&self.config.root);
        let report = discovery::scan(root, &self.config.template_prefix, &self.catalog).await?;

        {
            let builtins = self.builtins.read();
            let mut discovered = self.discovered.write();
            discovered.clear();
            for plugin in report.plugins {
                if builtins.contains(&plugin.id) {
                    warn!(plugin = %plugin.id, "Directory shadows a built-in plugin; ignoring");
                    continue;
                }
                discovered.insert(plugin.id.clone(), plugin);
            }
        }
        *self.skipped.write() = report.skipped;

        let ids: Vec<String> = self.discovered.read().keys().cloned().collect();
        Ok(ids.iter().filter_map(|id| self.registration(id)).collect())
    }

    /// Load a discovered plugin. Loading a loaded plugin is a no-op.
    pub async fn load(&self, id: &str) -> Result<PluginRegistration> {
        let _guard = self.lifecycle.lock().await;
        self.load_inner(id).await
    }

    async fn load_inner(&self, id: &str) -> Result<PluginRegistration> {
        if !self.registry.contains(id) {
            let found = self
                .discovered
                .read()
                .get(id)
                .cloned()
                .ok_or_else(|| BridgeError::UnknownPlugin(id.to_string()))?;
            let plugin = self
                .catalog
                .create(id)
                .ok_or_else(|| BridgeError::NoImplementation(id.to_string()))?;
            self.activate(id, plugin, found.dir, found.config).await?;
        } else {
            debug!(plugin = %id, "Plugin already loaded");
        }
        self.registration(id)
            .ok_or_else(|| BridgeError::UnknownPlugin(id.to_string()))
    }

    /// Load every discovered plugin whose `enabled` flag is set.
    ///
    /// A plugin that fails to load is logged and skipped.
    pub async fn load_enabled(&self) -> Vec<PluginRegistration> {
        let _guard = self.lifecycle.lock().await;
        self.load_enabled_inner().await
    }

    async fn load_enabled_inner(&self) -> Vec<PluginRegistration> {
        let enabled: Vec<String> = self
            .discovered
            .read()
            .values()
            .filter(|p| p.enabled)
            .map(|p| p.id.clone())
            .collect();

        let mut loaded = Vec::new();
        for id in enabled {
            match self.load_inner(&id).await {
                Ok(registration) => loaded.push(registration),
                Err(e) => warn!(plugin = %id, error = %e, "Plugin failed to load"),
            }
        }
        loaded
    }

    async fn activate(
        &self,
        id: &str,
        plugin: Arc<dyn Plugin>,
        dir: PathBuf,
        config: serde_json::Value,
    ) -> Result<()> {
        let mut metadata = plugin.metadata();
        metadata.id = id.to_string();
        let ctx = PluginContext::new(
            id,
            dir.clone(),
            config,
            self.scheduler.clone(),
            self.host_info.clone(),
        );
        let stats = Arc::new(HookStats::new());

        info!(plugin = %id, version = %metadata.version, "Loading plugin");
        if let Err(e) =
            guarded_call(id, HookKind::OnLoad, &stats, self.limits(), plugin.on_load(ctx.clone())).await
        {
            ctx.cancel();
            ctx.join_tasks(Instant::now() + self.config.unload_timeout).await;
            return Err(e);
        }

        let loaded = Arc::new(LoadedPlugin {
            capabilities: plugin.capabilities(),
            commands: plugin.commands(),
            metadata,
            dir,
            plugin: plugin.clone(),
            context: ctx,
            stats,
        });

        let routes = self
            .routes
            .register_plugin(id, |registrar| plugin.register_routes(registrar));
        let collisions = self.registry.insert(loaded);
        info!(
            plugin = %id,
            routes = routes.len(),
            lost_commands = collisions.len(),
            "Plugin loaded"
        );
        Ok(())
    }

    /// Unload a plugin. Returns false if it was not loaded.
    pub async fn unload(&self, id: &str) -> Result<bool> {
        let _guard = self.lifecycle.lock().await;
        Ok(self.unload_inner(id).await)
    }

    async fn unload_inner(&self, id: &str) -> bool {
        let Some(loaded) = self.registry.remove(id) else {
            debug!(plugin = %id, "Unload requested for plugin that is not loaded");
            return false;
        };
        self.routes.remove_plugin(id);
        loaded.context.cancel();

        let deadline = Instant::now() + self.config.unload_timeout;
        let plugin = loaded.plugin.clone();
        let teardown = tokio::spawn(async move { plugin.on_unload().await });

        match tokio::time::timeout_at(deadline, teardown).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(plugin = %id, error = %format!("{:#}", e), "Plugin teardown failed"),
            Ok(Err(e)) => warn!(plugin = %id, error = %e, "Plugin teardown panicked"),
            Err(_) => warn!(
                plugin = %id,
                timeout = ?self.config.unload_timeout,
                "Plugin teardown did not finish in time; abandoning"
            ),
        }

        let abandoned = loaded.context.join_tasks(deadline).await;
        if abandoned > 0 {
            warn!(plugin = %id, tasks = abandoned, "Abandoned plugin background tasks");
        }
        info!(plugin = %id, "Plugin unloaded");
        true
    }

    /// Unload every discovered plugin, rediscover, and load the enabled
    /// ones. Built-ins and the radio link are untouched.
    pub async fn reload_all(&self) -> Result<Vec<PluginRegistration>> {
        let _guard = self.lifecycle.lock().await;
        info!("Reloading plugins");

        let builtins = self.builtins.read().clone();
        for id in self.registry.ids() {
            if !builtins.contains(&id) {
                self.unload_inner(&id).await;
            }
        }

        self.discover_inner(None).await?;
        Ok(self.load_enabled_inner().await)
    }

    /// Persist a plugin's `enabled` flag and load or unload it to match
    pub async fn toggle(&self, id: &str, enabled: bool) -> Result<PluginRegistration> {
        let _guard = self.lifecycle.lock().await;
        if self.builtins.read().contains(id) {
            return Err(BridgeError::InvalidConfig(format!(
                "built-in plugin {} cannot be toggled",
                id
            )));
        }

        let found = self
            .discovered
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownPlugin(id.to_string()))?;

        let set_flag = |cfg: &mut serde_json::Value| {
            if let Some(obj) = cfg.as_object_mut() {
                obj.insert("enabled".to_string(), serde_json::Value::Bool(enabled));
            }
        };

        let config = match self.registry.get(id) {
            Some(loaded) => loaded.context.update_config(set_flag).await?,
            None => {
                let mut config = found.config.clone();
                set_flag(&mut config);
                persist::atomic_write_json(&found.dir.join(PLUGIN_CONFIG_FILE), &config).await?;
                config
            }
        };

        if let Some(entry) = self.discovered.write().get_mut(id) {
            entry.enabled = enabled;
            entry.config = config;
        }
        info!(plugin = %id, enabled, "Plugin toggled");

        match (enabled, self.registry.contains(id)) {
            (true, false) => {
                self.load_inner(id).await?;
            }
            (false, true) => {
                self.unload_inner(id).await;
            }
            _ => {}
        }

        self.registration(id)
            .ok_or_else(|| BridgeError::UnknownPlugin(id.to_string()))
    }

    /// Unload everything, built-ins included
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        let mut ids = self.registry.ids();
        ids.reverse();
        for id in ids {
            self.unload_inner(&id).await;
        }
        self.builtins.write().clear();
        info!("Extension host stopped");
    }

    /// Registration record for `id`
    pub fn registration(&self, id: &str) -> Option<PluginRegistration> {
        let loaded = self.registry.get(id);
        let builtin = self.builtins.read().contains(id);
        let discovered = self.discovered.read().get(id).cloned();

        match (loaded, discovered) {
            (Some(p), found) => Some(PluginRegistration {
                id: id.to_string(),
                display_name: p.metadata.display_name.clone(),
                version: p.metadata.version.clone(),
                description: p.metadata.description.clone(),
                enabled: found.map(|f| f.enabled).unwrap_or(true),
                loaded: true,
                faulted: p.stats.is_disabled(),
                builtin,
                capabilities: p.capabilities.list(),
                commands: p.commands.clone(),
            }),
            (None, Some(f)) => Some(PluginRegistration {
                id: id.to_string(),
                display_name: f.metadata.display_name,
                version: f.metadata.version,
                description: f.metadata.description,
                enabled: f.enabled,
                loaded: false,
                faulted: false,
                builtin: false,
                capabilities: f.capabilities.list(),
                commands: f.commands,
            }),
            (None, None) => None,
        }
    }

    /// Everything the status surface reports about plugins
    pub fn status(&self) -> HostStatus {
        let mut ids = self.registry.ids();
        for id in self.discovered.read().keys() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        HostStatus {
            plugins: ids.iter().filter_map(|id| self.registration(id)).collect(),
            commands: self.registry.catalogue(),
            routes: self.routes.list(),
            skipped: self.skipped.read().iter().map(|s| s.name.clone()).collect(),
        }
    }
}

impl std::fmt::Debug for ExtensionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHost")
            .field("root", &self.config.root)
            .field("loaded", &self.registry.ids())
            .finish()
    }
}
