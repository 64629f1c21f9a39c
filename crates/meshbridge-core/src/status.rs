//! Status query surface

use serde::Serialize;
use std::fmt;

use crate::connection::{LinkState, LinkStats};
use crate::dispatcher::DispatchStats;
use crate::host::{PluginRegistration, RouteInfo};
use crate::host::registry::CommandEntry;
use crate::scheduler::SchedulerStats;
use crate::suppression::SuppressionStats;

/// Snapshot of the whole bridge
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    /// Crate version
    pub version: String,
    /// Bridge node name
    pub node_name: String,
    /// Command alias suffix
    pub alias_suffix: String,
    /// Radio link state
    pub link_state: LinkState,
    /// Connected transport
    pub active_transport: Option<String>,
    /// Link counters
    pub link: LinkStats,
    /// Requests waiting for transmission
    pub queued: usize,
    /// Scheduler counters
    pub scheduler: SchedulerStats,
    /// Dispatch counters
    pub dispatch: DispatchStats,
    /// Loop prevention counters
    pub suppression: SuppressionStats,
    /// Nodes currently suppressed
    pub suppressed_nodes: usize,
    /// Known plugins
    pub plugins: Vec<PluginRegistration>,
    /// Command catalogue
    pub commands: Vec<CommandEntry>,
    /// Webhook routes
    pub routes: Vec<RouteInfo>,
}

impl BridgeStatus {
    /// Loaded plugins
    pub fn loaded_plugins(&self) -> impl Iterator<Item = &PluginRegistration> {
        self.plugins.iter().filter(|p| p.loaded)
    }

    /// Plugins disabled by the failure breaker
    pub fn faulted_plugins(&self) -> impl Iterator<Item = &PluginRegistration> {
        self.plugins.iter().filter(|p| p.faulted)
    }

    /// Pretty JSON rendering
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "link={} via {} | rx={} tx={} | queued={} sent={} dropped={} | plugins {}/{} loaded, {} faulted | commands={}",
            self.link_state,
            self.active_transport.as_deref().unwrap_or("-"),
            self.link.messages_delivered,
            self.link.frames_sent,
            self.queued,
            self.scheduler.sent_requests,
            self.scheduler.dropped,
            self.loaded_plugins().count(),
            self.plugins.len(),
            self.faulted_plugins().count(),
            self.commands.len(),
        )
    }
}
