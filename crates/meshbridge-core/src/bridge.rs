//! MeshBridge - the bridge service
//!
//! Wires the connection manager, outbound scheduler, dispatcher and
//! extension host together and owns their tasks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          MeshBridge                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐ inbound ┌────────────┐ hooks ┌──────────────┐  │
//! │  │ Connection   │────────►│ Dispatcher │──────►│ Extension    │  │
//! │  │ Manager      │         └────────────┘       │ Host         │  │
//! │  │ (transports) │               │ replies      │ (plugins)    │  │
//! │  └──────────────┘               ▼              └──────────────┘  │
//! │         ▲               ┌────────────┐  sends         │          │
//! │         └───── chunks ──│ Outbound   │◄───────────────┘          │
//! │                         │ Scheduler  │── sent records ─► onSend  │
//! │                         └────────────┘                           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use meshbridge_core::{BridgeConfig, MeshBridge, PluginCatalog};
//!
//! let config = BridgeConfig::load("bridge.json").await?;
//! let (bridge, handle) = MeshBridge::from_config(config, PluginCatalog::new())?;
//! let task = tokio::spawn(bridge.run());
//!
//! println!("{}", handle.status().await?);
//! handle.shutdown().await?;
//! task.await??;
//! ```

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builtin::CoreCommands;
use crate::config::BridgeConfig;
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, Result};
use crate::host::{
    ExtensionHost, PluginCatalog, PluginRegistration, RouteTable, WebhookRequest, WebhookResponse,
};
use crate::host::routes::Method;
use crate::message::{InboundMessage, OutboundRequest};
use crate::scheduler::{EnqueueReceipt, OutboundScheduler, Ticket, TicketStatus};
use crate::status::BridgeStatus;
use crate::transport::{open_transports, Transport};

/// Commands accepted by the bridge task
#[derive(Debug)]
enum BridgeCommand {
    Status(oneshot::Sender<BridgeStatus>),
    Reload(oneshot::Sender<Result<Vec<PluginRegistration>>>),
    Toggle {
        id: String,
        enabled: bool,
        reply: oneshot::Sender<Result<PluginRegistration>>,
    },
    Shutdown,
}

/// Handle for controlling a running [`MeshBridge`]
#[derive(Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
    link: ConnectionHandle,
    scheduler: OutboundScheduler,
    routes: RouteTable,
}

impl BridgeHandle {
    /// Snapshot of link, queue and plugin state
    pub async fn status(&self) -> Result<BridgeStatus> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::Status(tx))
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)
    }

    /// Unload, rediscover and reload plugins without touching the link
    pub async fn reload(&self) -> Result<Vec<PluginRegistration>> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::Reload(tx))
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)?
    }

    /// Enable or disable a plugin and persist the choice
    pub async fn toggle(&self, id: impl Into<String>, enabled: bool) -> Result<PluginRegistration> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::Toggle {
                id: id.into(),
                enabled,
                reply: tx,
            })
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)?
    }

    /// Queue a message for the mesh
    pub fn send(&self, request: OutboundRequest) -> Result<EnqueueReceipt> {
        self.scheduler.enqueue(request)
    }

    /// Status of a queued request
    pub fn ticket_status(&self, ticket: &Ticket) -> Option<TicketStatus> {
        self.scheduler.status(ticket)
    }

    /// Invoke a plugin webhook route. `None` when no plugin serves it.
    pub async fn call_route(
        &self,
        method: Method,
        path: &str,
        request: WebhookRequest,
    ) -> Option<anyhow::Result<WebhookResponse>> {
        self.routes.call(method, path, request).await
    }

    /// The radio link
    pub fn link(&self) -> &ConnectionHandle {
        &self.link
    }

    /// Stop the bridge: unload plugins, stop the scheduler, disconnect
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

/// The bridge service
pub struct MeshBridge {
    config: BridgeConfig,
    manager: ConnectionManager,
    link: ConnectionHandle,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    scheduler: OutboundScheduler,
    dispatcher: Dispatcher,
    host: Arc<ExtensionHost>,
    command_rx: mpsc::Receiver<BridgeCommand>,
}

impl MeshBridge {
    /// Create a bridge over explicit transports, in priority order
    pub fn new(
        config: BridgeConfig,
        transports: Vec<Box<dyn Transport>>,
        catalog: PluginCatalog,
    ) -> Result<(Self, BridgeHandle)> {
        config.validate_settings()?;
        if transports.is_empty() {
            return Err(BridgeError::MissingConfig("transports".to_string()));
        }

        let (manager, link, inbound_rx) = ConnectionManager::new(&config, transports);
        let scheduler = OutboundScheduler::new(config.scheduler.clone());
        let host = Arc::new(ExtensionHost::new(&config, catalog, scheduler.clone()));
        let dispatcher = Dispatcher::new(
            &config,
            host.registry().clone(),
            scheduler.clone(),
            host.limits(),
        );

        let (command_tx, command_rx) = mpsc::channel(32);
        let handle = BridgeHandle {
            command_tx,
            link: link.clone(),
            scheduler: scheduler.clone(),
            routes: host.routes().clone(),
        };

        let bridge = Self {
            config,
            manager,
            link,
            inbound_rx,
            scheduler,
            dispatcher,
            host,
            command_rx,
        };
        Ok((bridge, handle))
    }

    /// Create a bridge with transports built from configuration
    pub fn from_config(config: BridgeConfig, catalog: PluginCatalog) -> Result<(Self, BridgeHandle)> {
        let transports = open_transports(&config.transports)?;
        Self::new(config, transports, catalog)
    }

    /// Run until shut down.
    ///
    /// Loads the core command handler and every enabled plugin, starts the
    /// link, then serves handle requests. Returns an error only for
    /// configuration problems found at startup.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            manager,
            link,
            inbound_rx,
            scheduler,
            dispatcher,
            host,
            mut command_rx,
        } = self;

        info!(
            node = %config.node.name,
            alias = %config.commands.alias(),
            "Starting mesh bridge"
        );

        let core = CoreCommands::new(&config, host.registry().clone());
        host.register_builtin(Arc::new(core)).await?;
        match host.discover(None).await {
            Ok(found) => {
                debug!(plugins = found.len(), "Plugins discovered");
                let loaded = host.load_enabled().await;
                info!(loaded = loaded.len(), "Plugins loaded");
            }
            Err(e) => warn!(error = %e, "Plugin discovery failed; running with built-ins only"),
        }

        let cancel = CancellationToken::new();
        let manager_task = tokio::spawn(async move {
            if let Err(e) = manager.run().await {
                error!(error = %e, "Connection manager stopped with error");
            }
        });
        let scheduler_task = tokio::spawn(scheduler.clone().run(link.clone(), cancel.child_token()));
        let dispatch_cancel = cancel.child_token();
        let dispatcher_task = tokio::spawn(dispatcher.clone().run(
            inbound_rx,
            scheduler.subscribe_sent(),
            dispatch_cancel.clone(),
        ));

        if let Err(e) = link.connect().await {
            error!(error = %e, "Radio link cannot start");
            let tasks = Tasks {
                dispatch_cancel,
                dispatcher: dispatcher_task,
                scheduler: scheduler_task,
                manager: manager_task,
            };
            shutdown(&host, &link, &cancel, tasks).await;
            return Err(e);
        }

        while let Some(command) = command_rx.recv().await {
            match command {
                BridgeCommand::Status(reply) => {
                    let _ = reply.send(collect_status(&config, &link, &scheduler, &dispatcher, &host));
                }
                BridgeCommand::Reload(reply) => {
                    let _ = reply.send(host.reload_all().await);
                }
                BridgeCommand::Toggle { id, enabled, reply } => {
                    let _ = reply.send(host.toggle(&id, enabled).await);
                }
                BridgeCommand::Shutdown => break,
            }
        }

        let tasks = Tasks {
            dispatch_cancel,
            dispatcher: dispatcher_task,
            scheduler: scheduler_task,
            manager: manager_task,
        };
        shutdown(&host, &link, &cancel, tasks).await;
        Ok(())
    }
}

struct Tasks {
    dispatch_cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    scheduler: JoinHandle<()>,
    manager: JoinHandle<()>,
}

async fn shutdown(host: &ExtensionHost, link: &ConnectionHandle, cancel: &CancellationToken, tasks: Tasks) {
    info!("Shutting down mesh bridge");

    tasks.dispatch_cancel.cancel();
    let _ = tasks.dispatcher.await;

    host.shutdown().await;

    cancel.cancel();
    let _ = tasks.scheduler.await;

    if let Err(e) = link.shutdown().await {
        debug!(error = %e, "Link already stopped");
    }
    let _ = tasks.manager.await;
    info!("Mesh bridge stopped");
}

fn collect_status(
    config: &BridgeConfig,
    link: &ConnectionHandle,
    scheduler: &OutboundScheduler,
    dispatcher: &Dispatcher,
    host: &ExtensionHost,
) -> BridgeStatus {
    let plugins = host.status();
    BridgeStatus {
        version: crate::VERSION.to_string(),
        node_name: config.node.name.clone(),
        alias_suffix: config.commands.alias().to_string(),
        link_state: link.current_state(),
        active_transport: link.active_transport(),
        link: link.stats(),
        queued: scheduler.queued(),
        scheduler: scheduler.stats(),
        dispatch: dispatcher.stats(),
        suppression: dispatcher.suppression().stats(),
        suppressed_nodes: dispatcher.suppression().len(),
        plugins: plugins.plugins,
        commands: plugins.commands,
        routes: plugins.routes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfigBuilder;
    use crate::connection::LinkState;
    use crate::test_utils::{write_plugin_dir, MockTransport, RecordingPlugin};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_bridge_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        write_plugin_dir(root.path(), "alpha", json!({ "enabled": true })).unwrap();
        let config = BridgeConfigBuilder::new()
            .alias_suffix("x7")
            .plugin_root(root.path())
            .build();
        let (transport, link) = MockTransport::new("radio");
        let catalog = PluginCatalog::new().with("alpha", || RecordingPlugin::new("alpha"));
        let (bridge, handle) = MeshBridge::new(config, vec![Box::new(transport)], catalog).unwrap();
        let task = tokio::spawn(bridge.run());

        assert!(handle.link().wait_until_usable(Duration::from_secs(10)).await);
        let status = handle.status().await.unwrap();
        assert_eq!(status.link_state, LinkState::Connected);
        let ids: Vec<&str> = status.plugins.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["core", "alpha"]);
        assert!(status.commands.iter().any(|c| c.name == "ping" && c.owner == "core"));
        assert!(status.to_string().contains("link=connected"));

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
        assert!(!link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_through_handle() {
        let root = tempfile::tempdir().unwrap();
        write_plugin_dir(root.path(), "alpha", json!({ "enabled": false })).unwrap();
        let config = BridgeConfigBuilder::new()
            .alias_suffix("x7")
            .plugin_root(root.path())
            .build();
        let (transport, _link) = MockTransport::new("radio");
        let catalog = PluginCatalog::new().with("alpha", || RecordingPlugin::new("alpha"));
        let (bridge, handle) = MeshBridge::new(config, vec![Box::new(transport)], catalog).unwrap();
        let task = tokio::spawn(bridge.run());

        let registration = handle.toggle("alpha", true).await.unwrap();
        assert!(registration.loaded);
        assert!(matches!(
            handle.toggle("ghost", true).await,
            Err(BridgeError::UnknownPlugin(_))
        ));

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected_at_startup() {
        let mut config = BridgeConfigBuilder::new().alias_suffix("x7").build();
        config.scheduler.frame_size = 0;
        let result = MeshBridge::new(config, Vec::new(), PluginCatalog::new());
        assert!(matches!(result, Err(e) if e.is_fatal()));
    }

    #[test]
    fn test_bridge_without_transports_rejected() {
        let config = BridgeConfigBuilder::new().alias_suffix("x7").build();
        let result = MeshBridge::new(config, Vec::new(), PluginCatalog::new());
        assert!(matches!(result, Err(BridgeError::MissingConfig(field)) if field == "transports"));
    }
}
