//! Host services handed to a plugin
//!
//! A [`PluginContext`] is the only way a plugin reaches the rest of the
//! bridge: sending to the mesh, logging, its own configuration and
//! background tasks. Every context carries a cancellation token that the
//! host fires on unload; after that the context refuses to send and its
//! periodic tasks stop at their next tick.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::cell::RefCell;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{BridgeError, Result};
use crate::message::{NodeId, OutboundRequest, Priority};
use crate::persist;
use crate::scheduler::{EnqueueReceipt, OutboundScheduler, Ticket};

/// Name of the per-plugin configuration file
pub const PLUGIN_CONFIG_FILE: &str = "config.json";

tokio::task_local! {
    static DEFERRED: RefCell<Vec<DeferredSend>>;
}

/// A send held back until dispatch completes, with the ticket already
/// handed to the plugin
#[derive(Debug, Clone)]
pub(crate) struct DeferredSend {
    pub ticket: Ticket,
    pub request: OutboundRequest,
}

/// Run `fut` with sends from plugin contexts held back.
///
/// Returns the output of `fut` and the sends it issued, in order. Used by
/// the dispatcher so a hook sending to the mesh cannot re-enter dispatch.
pub(crate) async fn collect_deferred<F: Future>(fut: F) -> (F::Output, Vec<DeferredSend>) {
    DEFERRED
        .scope(RefCell::new(Vec::new()), async move {
            let output = fut.await;
            let sends = DEFERRED.with(|buf| buf.take());
            (output, sends)
        })
        .await
}

/// Read-only host settings visible to every plugin
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    /// Bridge node name
    pub node_name: String,
    /// Command alias suffix
    pub alias_suffix: String,
    /// Machine-origin marker
    pub machine_marker: String,
    /// Plugin root directory
    pub plugin_root: PathBuf,
}

/// Result of [`PluginContext::send_to_mesh`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued for transmission
    Queued(EnqueueReceipt),
    /// Called during dispatch; will be queued once dispatch completes.
    /// The ticket is live immediately and reads `Dropped` if the send is
    /// discarded.
    Deferred(Ticket),
}

impl SendOutcome {
    /// Ticket for [`OutboundScheduler::status`] queries
    pub fn ticket(&self) -> Ticket {
        match self {
            SendOutcome::Queued(receipt) => receipt.ticket,
            SendOutcome::Deferred(ticket) => *ticket,
        }
    }
}

struct ContextInner {
    plugin_id: String,
    dir: PathBuf,
    config: RwLock<serde_json::Value>,
    persist_lock: tokio::sync::Mutex<()>,
    scheduler: OutboundScheduler,
    host: HostInfo,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Services the host provides to one plugin
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<ContextInner>,
}

impl PluginContext {
    pub(crate) fn new(
        plugin_id: impl Into<String>,
        dir: impl Into<PathBuf>,
        config: serde_json::Value,
        scheduler: OutboundScheduler,
        host: HostInfo,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                plugin_id: plugin_id.into(),
                dir: dir.into(),
                config: RwLock::new(config),
                persist_lock: tokio::sync::Mutex::new(()),
                scheduler,
                host,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Plugin identifier
    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }

    /// The plugin's private directory
    pub fn data_dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Host settings
    pub fn host(&self) -> &HostInfo {
        &self.inner.host
    }

    /// Whether the plugin has been unloaded
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Token fired when the plugin is unloaded
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    /// Send text to the mesh.
    ///
    /// With a destination the message goes direct, otherwise it is a
    /// broadcast on `channel` (primary when `None`).
    pub fn send_to_mesh(
        &self,
        text: impl Into<String>,
        channel: Option<u8>,
        destination: Option<NodeId>,
    ) -> Result<SendOutcome> {
        let text = text.into();
        let request = match destination {
            Some(node) => OutboundRequest::direct(text, node),
            None => OutboundRequest::broadcast(text, channel.unwrap_or(0)),
        };
        self.submit(request)
    }

    /// Send an emergency-priority broadcast
    pub fn send_emergency(&self, text: impl Into<String>, channel: Option<u8>) -> Result<SendOutcome> {
        let request = OutboundRequest::broadcast(text, channel.unwrap_or(0))
            .with_priority(Priority::Emergency);
        self.submit(request)
    }

    fn submit(&self, request: OutboundRequest) -> Result<SendOutcome> {
        if self.is_cancelled() {
            warn!(plugin = %self.inner.plugin_id, "Send refused: plugin is unloaded");
            return Err(BridgeError::PluginUnloaded(self.inner.plugin_id.clone()));
        }
        if request.text.is_empty() {
            return Err(BridgeError::EmptyMessage);
        }
        let request = request.with_origin(self.inner.plugin_id.clone());

        if DEFERRED.try_with(|_| ()).is_err() {
            return self.inner.scheduler.enqueue(request).map(SendOutcome::Queued);
        }

        let ticket = self.inner.scheduler.reserve();
        DEFERRED.with(|buf| buf.borrow_mut().push(DeferredSend { ticket, request }));
        trace!(plugin = %self.inner.plugin_id, %ticket, "Send deferred until dispatch completes");
        Ok(SendOutcome::Deferred(ticket))
    }

    /// Log a line tagged with the plugin id
    pub fn log(&self, text: impl AsRef<str>) {
        info!(plugin = %self.inner.plugin_id, "{}", text.as_ref());
    }

    /// Log a warning tagged with the plugin id
    pub fn log_warning(&self, text: impl AsRef<str>) {
        warn!(plugin = %self.inner.plugin_id, "{}", text.as_ref());
    }

    /// Snapshot of the plugin's own configuration
    pub fn config(&self) -> serde_json::Value {
        self.inner.config.read().clone()
    }

    /// Read-modify-persist the plugin's configuration.
    ///
    /// `update` runs on a copy; the result is written atomically to the
    /// plugin's `config.json` and becomes the new snapshot only once the
    /// write succeeded.
    pub async fn update_config<F>(&self, update: F) -> Result<serde_json::Value>
    where
        F: FnOnce(&mut serde_json::Value),
    {
        let _guard = self.inner.persist_lock.lock().await;
        let mut next = self.config();
        update(&mut next);

        let path = self.inner.dir.join(PLUGIN_CONFIG_FILE);
        persist::atomic_write_json(&path, &next).await?;
        *self.inner.config.write() = next.clone();
        debug!(plugin = %self.inner.plugin_id, path = %path.display(), "Plugin configuration saved");
        Ok(next)
    }

    /// Run `tick` every `interval` until the plugin is unloaded.
    ///
    /// The sleep is interrupted by unload, so the task stops without
    /// waiting out the interval. A tick already running is not interrupted.
    pub fn spawn_periodic<F, Fut>(&self, name: &str, interval: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.inner.cancel.clone();
        let plugin = self.inner.plugin_id.clone();
        let name = name.to_string();
        let handle = tokio::spawn(async move {
            debug!(plugin = %plugin, task = %name, ?interval, "Periodic task started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if cancel.is_cancelled() {
                    break;
                }
                tick().await;
            }
            debug!(plugin = %plugin, task = %name, "Periodic task stopped");
        });
        self.inner.tasks.lock().push(handle);
    }

    /// Fire the cancellation token
    pub(crate) fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Wait for background tasks to finish, up to `deadline`. Tasks still
    /// running afterwards are aborted. Returns how many had to be aborted.
    pub(crate) async fn join_tasks(&self, deadline: tokio::time::Instant) -> usize {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        let mut abandoned = 0;
        for mut task in tasks {
            tokio::select! {
                _ = &mut task => {}
                _ = tokio::time::sleep_until(deadline) => {
                    task.abort();
                    abandoned += 1;
                }
            }
        }
        abandoned
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.inner.plugin_id)
            .field("dir", &self.inner.dir)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
