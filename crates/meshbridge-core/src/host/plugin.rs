//! The plugin interface
//!
//! A plugin declares up front which hooks it implements through
//! [`Capabilities`]; the dispatcher never calls a hook that was not
//! declared. Hooks take `&self`, so plugins keep mutable state behind their
//! own locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use super::context::PluginContext;
use super::routes::RouteRegistrar;
use crate::command::Command;
use crate::message::{Coordinates, InboundMessage, NodeId};
use crate::scheduler::OutboundRecord;

/// Hooks a plugin can implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    /// Observes every human-origin inbound message
    OnMessage,
    /// Answers commands
    OnCommand,
    /// Receives every emergency alert
    OnEmergency,
    /// Observes transmitted requests from other plugins
    OnSend,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::OnMessage => write!(f, "onMessage"),
            Capability::OnCommand => write!(f, "onCommand"),
            Capability::OnEmergency => write!(f, "onEmergency"),
            Capability::OnSend => write!(f, "onSend"),
        }
    }
}

/// Declared hook set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    bits: u8,
}

impl Capabilities {
    /// No hooks
    pub const NONE: Capabilities = Capabilities { bits: 0 };

    const fn bit(cap: Capability) -> u8 {
        match cap {
            Capability::OnMessage => 1,
            Capability::OnCommand => 2,
            Capability::OnEmergency => 4,
            Capability::OnSend => 8,
        }
    }

    /// Add a capability
    pub const fn with(self, cap: Capability) -> Self {
        Self {
            bits: self.bits | Self::bit(cap),
        }
    }

    /// Whether `cap` was declared
    pub const fn has(&self, cap: Capability) -> bool {
        self.bits & Self::bit(cap) != 0
    }

    /// Declared capabilities in a stable order
    pub fn list(&self) -> Vec<Capability> {
        [
            Capability::OnMessage,
            Capability::OnCommand,
            Capability::OnEmergency,
            Capability::OnSend,
        ]
        .into_iter()
        .filter(|c| self.has(*c))
        .collect()
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

/// Static plugin description
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginMetadata {
    /// Identifier; matches the plugin directory name
    pub id: String,
    /// Human-readable name
    pub display_name: String,
    /// Plugin version
    pub version: String,
    /// One-line description
    pub description: String,
}

impl PluginMetadata {
    /// Metadata with display name equal to the id
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            version: version.into(),
            description: String::new(),
        }
    }

    /// Set the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// An inbound message as seen by observers
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// The message
    pub message: InboundMessage,
    /// Parsed command, if the text was one
    pub command: Option<Command>,
    /// Machine-generated traffic; observers may log it but must not answer
    pub machine_origin: bool,
}

/// An emergency raised from the mesh
#[derive(Debug, Clone, Serialize)]
pub struct EmergencyAlert {
    /// Node that raised it
    pub sender_id: NodeId,
    /// Sender short name
    pub sender_short_name: String,
    /// Sender long name
    pub sender_long_name: String,
    /// Text the user typed after the command
    pub user_message: String,
    /// Last known position of the sender
    pub coordinates: Option<Coordinates>,
    /// Full alert text, ready to forward
    pub text: String,
    /// When the alert was raised
    pub raised_at: DateTime<Utc>,
}

impl EmergencyAlert {
    /// Compose an alert for `message` with the user's own words
    pub fn compose(message: &InboundMessage, user_message: &str) -> Self {
        let mut text = format!(
            "EMERGENCY from {} ({}) [Node {}]:\n",
            message.sender_short_name, message.sender_long_name, message.sender_id
        );
        if let Some(pos) = &message.position {
            text.push_str(&format!(" - Location: {} {}\n", pos, pos.maps_url()));
            if let Some(fixed_at) = pos.fixed_at {
                text.push_str(&format!(" - Last GPS time: {}\n", fixed_at.to_rfc3339()));
            }
        }
        if !user_message.is_empty() {
            text.push_str(&format!(" - Message: {}\n", user_message));
        }

        Self {
            sender_id: message.sender_id,
            sender_short_name: message.sender_short_name.clone(),
            sender_long_name: message.sender_long_name.clone(),
            user_message: user_message.to_string(),
            coordinates: message.position,
            text,
            raised_at: Utc::now(),
        }
    }
}

/// A bridge plugin
///
/// Every hook has a no-op default except [`Plugin::on_unload`], which each
/// plugin must implement to release what it acquired in `on_load`.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Static description
    fn metadata(&self) -> PluginMetadata;

    /// Hooks this plugin implements
    fn capabilities(&self) -> Capabilities;

    /// Commands this plugin answers, name to description
    fn commands(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Called once after the plugin is created
    async fn on_load(&self, _ctx: PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once before the plugin is dropped
    async fn on_unload(&self) -> anyhow::Result<()>;

    /// Observe an inbound message
    async fn on_message(&self, _event: &MessageEvent) -> anyhow::Result<()> {
        Ok(())
    }

    /// Answer a command. `None` lets the next handler try.
    async fn on_command(
        &self,
        _command: &Command,
        _message: &InboundMessage,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    /// Handle an emergency alert
    async fn on_emergency(&self, _alert: &EmergencyAlert) -> anyhow::Result<()> {
        Ok(())
    }

    /// Observe a request another plugin transmitted
    async fn on_send(&self, _record: &OutboundRecord) -> anyhow::Result<()> {
        Ok(())
    }

    /// Register inbound webhook routes
    fn register_routes(&self, _routes: &mut RouteRegistrar<'_>) {}
}

/// Creates plugin instances; one factory per plugin id
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Plugin implementations known to this process, by id
#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: HashMap<String, PluginFactory>,
}

impl PluginCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `id`
    pub fn register<F, P>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Plugin + 'static,
    {
        self.factories
            .insert(id.into(), Arc::new(move || Arc::new(factory()) as Arc<dyn Plugin>));
        self
    }

    /// Builder-style [`PluginCatalog::register`]
    pub fn with<F, P>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Plugin + 'static,
    {
        self.register(id, factory);
        self
    }

    /// Whether an implementation exists for `id`
    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Create a fresh instance
    pub fn create(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.factories.get(id).map(|f| f())
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("ids", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Coordinates;

    struct Quiet;

    #[async_trait]
    impl Plugin for Quiet {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new("quiet", "0.1.0")
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::NONE
        }
        async fn on_unload(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_capabilities() {
        let caps = Capabilities::NONE
            .with(Capability::OnCommand)
            .with(Capability::OnSend);
        assert!(caps.has(Capability::OnCommand));
        assert!(!caps.has(Capability::OnMessage));
        assert_eq!(caps.list(), vec![Capability::OnCommand, Capability::OnSend]);

        let collected: Capabilities = [Capability::OnEmergency].into_iter().collect();
        assert!(collected.has(Capability::OnEmergency));
        assert_eq!(Capability::OnEmergency.to_string(), "onEmergency");
    }

    #[test]
    fn test_catalog_creates_fresh_instances() {
        let catalog = PluginCatalog::new().with("quiet", || Quiet);
        assert!(catalog.contains("quiet"));
        assert!(catalog.create("missing").is_none());
        let a = catalog.create("quiet").unwrap();
        let b = catalog.create("quiet").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.metadata().id, "quiet");
    }

    #[test]
    fn test_alert_composition() {
        let msg = InboundMessage::new(NodeId(0xabc), "/911 broken leg", 0)
            .with_names("HIKR", "Hiker One")
            .with_position(Coordinates::from_fixed(401_234_567, -1_051_234_567, 0));
        let alert = EmergencyAlert::compose(&msg, "broken leg");
        assert!(alert
            .text
            .starts_with("EMERGENCY from HIKR (Hiker One) [Node !00000abc]:\n"));
        assert!(alert.text.contains("Location: 40.123457, -105.123457"));
        assert!(alert.text.contains(" - Message: broken leg"));
        assert!(alert.coordinates.is_some());
    }

    #[test]
    fn test_alert_without_position() {
        let msg = InboundMessage::new(NodeId(1), "/emergency", 0);
        let alert = EmergencyAlert::compose(&msg, "");
        assert!(!alert.text.contains("Location"));
        assert!(!alert.text.contains("Message"));
    }
}
