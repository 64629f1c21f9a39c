//! Commands answered by the bridge itself
//!
//! [`CoreCommands`] is registered before any discovered plugin, so it owns
//! the names it declares and is asked first for everything else too.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::command::{Command, CommandParser};
use crate::config::{BridgeConfig, CustomCommand, NodeConfig};
use crate::host::plugin::{Capabilities, Capability, Plugin, PluginMetadata};
use crate::host::registry::PluginRegistry;
use crate::message::{InboundMessage, CORE_ORIGIN};

/// Acknowledgement sent back to whoever raised an emergency
pub const EMERGENCY_ACK: &str = "Emergency alert sent. Stay safe.";

/// The built-in command handler
pub struct CoreCommands {
    node: NodeConfig,
    custom: Vec<CustomCommand>,
    emergency: Vec<String>,
    parser: CommandParser,
    registry: PluginRegistry,
}

impl CoreCommands {
    /// Build from configuration. `registry` is read when answering `/help`.
    pub fn new(config: &BridgeConfig, registry: PluginRegistry) -> Self {
        Self {
            node: config.node.clone(),
            custom: config.commands.custom.clone(),
            emergency: config.commands.emergency.clone(),
            parser: CommandParser::from_config(&config.commands),
            registry,
        }
    }

    fn greeting(&self, message: &InboundMessage) -> String {
        let location = self
            .node
            .location
            .as_deref()
            .map(|l| format!(" in {}", l))
            .unwrap_or_default();
        format!(
            "Hi {}! {}{} hears you loud and clear.",
            display_name(message),
            self.node.name,
            location
        )
    }

    fn about(&self) -> String {
        format!(
            "{} runs meshbridge {}, a plugin bridge for this mesh. Try {} for commands.",
            self.node.name,
            crate::VERSION,
            self.parser.invocation("help")
        )
    }

    fn help(&self) -> String {
        let commands: Vec<String> = self
            .registry
            .catalogue()
            .iter()
            .map(|entry| self.parser.invocation(&entry.name))
            .collect();
        format!("Commands: {}", commands.join(", "))
    }

    fn whereami(&self, message: &InboundMessage) -> String {
        match &message.position {
            Some(pos) => {
                let mut text = format!("{}, you are at {} {}", display_name(message), pos, pos.maps_url());
                if let Some(fixed_at) = pos.fixed_at {
                    text.push_str(&format!(" (fix {})", fixed_at.format("%Y-%m-%d %H:%M UTC")));
                }
                text
            }
            None => format!("Sorry {}, I have no GPS fix for your node.", display_name(message)),
        }
    }
}

fn display_name(message: &InboundMessage) -> String {
    if message.sender_short_name.is_empty() {
        message.sender_id.to_string()
    } else {
        message.sender_short_name.clone()
    }
}

#[async_trait]
impl Plugin for CoreCommands {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(CORE_ORIGIN, crate::VERSION)
            .with_display_name("Core commands")
            .with_description("Built-in commands answered by the bridge")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.with(Capability::OnCommand)
    }

    fn commands(&self) -> BTreeMap<String, String> {
        let mut commands: BTreeMap<String, String> = [
            ("ping", "Check the bridge is alive"),
            ("test", "Get a greeting from the bridge"),
            ("about", "What this bridge is"),
            ("help", "List commands"),
            ("motd", "Message of the day"),
            ("whereami", "Your last reported position"),
        ]
        .into_iter()
        .map(|(name, description)| (name.to_string(), description.to_string()))
        .collect();

        for name in &self.emergency {
            commands.insert(name.to_lowercase(), "Raise an emergency alert".to_string());
        }
        for custom in &self.custom {
            commands.insert(custom.command.to_lowercase(), custom.description.clone());
        }
        commands
    }

    async fn on_unload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_command(
        &self,
        command: &Command,
        message: &InboundMessage,
    ) -> anyhow::Result<Option<String>> {
        if command.emergency {
            return Ok(Some(EMERGENCY_ACK.to_string()));
        }

        let reply = match command.name.as_str() {
            "ping" => Some("pong".to_string()),
            "test" => Some(self.greeting(message)),
            "about" => Some(self.about()),
            "help" => Some(self.help()),
            "motd" => Some(self.node.motd.clone()),
            "whereami" => Some(self.whereami(message)),
            name => self
                .custom
                .iter()
                .find(|c| c.command.eq_ignore_ascii_case(name))
                .map(|c| c.response.clone()),
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfigBuilder;
    use crate::message::{Coordinates, NodeId};

    fn core() -> (CoreCommands, CommandParser) {
        let mut config = BridgeConfigBuilder::new()
            .alias_suffix("x7")
            .node_name("Ridge")
            .custom_command("hours", "Open 9-5", "Opening hours")
            .build();
        config.node.location = Some("Boulder".to_string());
        let parser = CommandParser::from_config(&config.commands);
        (CoreCommands::new(&config, PluginRegistry::new()), parser)
    }

    async fn ask(text: &str, message: InboundMessage) -> Option<String> {
        let (core, parser) = core();
        let cmd = parser.parse(text).unwrap();
        core.on_command(&cmd, &message).await.unwrap()
    }

    fn msg() -> InboundMessage {
        InboundMessage::new(NodeId(0x42), "", 1).with_names("ALIC", "Alice")
    }

    #[tokio::test]
    async fn test_ping_and_test() {
        assert_eq!(ask("/ping", msg()).await.as_deref(), Some("pong"));
        let greeting = ask("/test", msg()).await.unwrap();
        assert!(greeting.contains("ALIC"));
        assert!(greeting.contains("Ridge in Boulder"));
    }

    #[tokio::test]
    async fn test_emergency_ack() {
        assert_eq!(ask("/911 help", msg()).await.as_deref(), Some(EMERGENCY_ACK));
        assert_eq!(ask("/emergency", msg()).await.as_deref(), Some(EMERGENCY_ACK));
    }

    #[tokio::test]
    async fn test_whereami() {
        let none = ask("/whereami-x7", msg()).await.unwrap();
        assert_eq!(none, "Sorry ALIC, I have no GPS fix for your node.");

        let located = msg().with_position(Coordinates::from_fixed(400_000_000, -1_050_000_000, 0));
        let reply = ask("/whereami-x7", located).await.unwrap();
        assert!(reply.contains("40.000000, -105.000000"));
        assert!(reply.contains("maps.google.com"));
    }

    #[tokio::test]
    async fn test_custom_and_unknown() {
        assert_eq!(ask("/hours-x7", msg()).await.as_deref(), Some("Open 9-5"));
        assert!(ask("/weather-x7", msg()).await.is_none());
    }

    #[test]
    fn test_declares_custom_commands() {
        let (core, _) = core();
        let commands = core.commands();
        assert_eq!(commands.get("hours").map(String::as_str), Some("Opening hours"));
        assert!(commands.contains_key("911"));
        assert!(commands.contains_key("whereami"));
    }
}
