//! Starting point for new plugins: one command, an emergency log and a
//! status route

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meshbridge_core::host::{Method, WebhookResponse};
use meshbridge_core::{
    Capabilities, Capability, Command, EmergencyAlert, InboundMessage, Plugin, PluginContext,
    PluginMetadata, RouteRegistrar,
};

pub(crate) const ID: &str = "example";

#[derive(Default)]
struct Counters {
    greetings: AtomicU64,
    emergencies: AtomicU64,
}

/// Answers `/hello-<alias>` and logs emergencies
#[derive(Default)]
pub struct ExamplePlugin {
    ctx: Mutex<Option<PluginContext>>,
    counters: Arc<Counters>,
}

impl ExamplePlugin {
    fn greeting(&self, command: &Command, message: &InboundMessage) -> String {
        let name = if message.sender_short_name.is_empty() {
            message.sender_id.to_string()
        } else {
            message.sender_short_name.clone()
        };
        let greeting = self
            .ctx
            .lock()
            .as_ref()
            .and_then(|ctx| ctx.config().get("greeting").and_then(|g| g.as_str()).map(str::to_string))
            .unwrap_or_else(|| "Hello".to_string());

        if command.args.is_empty() {
            format!("{} {}!", greeting, name)
        } else {
            format!("{} {}! You said: {}", greeting, name, command.args)
        }
    }
}

#[async_trait]
impl Plugin for ExamplePlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(ID, env!("CARGO_PKG_VERSION"))
            .with_display_name("Example")
            .with_description("Greets people and logs emergencies")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
            .with(Capability::OnCommand)
            .with(Capability::OnEmergency)
    }

    fn commands(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("hello".to_string(), "Say hello".to_string())])
    }

    async fn on_load(&self, ctx: PluginContext) -> anyhow::Result<()> {
        ctx.log("Example plugin ready");
        *self.ctx.lock() = Some(ctx);
        Ok(())
    }

    async fn on_unload(&self) -> anyhow::Result<()> {
        self.ctx.lock().take();
        Ok(())
    }

    async fn on_command(
        &self,
        command: &Command,
        message: &InboundMessage,
    ) -> anyhow::Result<Option<String>> {
        if command.name != "hello" {
            return Ok(None);
        }
        self.counters.greetings.fetch_add(1, Ordering::Relaxed);
        Ok(Some(self.greeting(command, message)))
    }

    async fn on_emergency(&self, alert: &EmergencyAlert) -> anyhow::Result<()> {
        self.counters.emergencies.fetch_add(1, Ordering::Relaxed);
        if let Some(ctx) = self.ctx.lock().as_ref() {
            ctx.log_warning(alert.text.trim_end());
        }
        Ok(())
    }

    fn register_routes(&self, routes: &mut RouteRegistrar<'_>) {
        let counters = self.counters.clone();
        routes.route(Method::Get, "/example/status", move |_req| {
            let counters = counters.clone();
            async move {
                Ok(WebhookResponse::ok(json!({
                    "greetings": counters.greetings.load(Ordering::Relaxed),
                    "emergencies": counters.emergencies.load(Ordering::Relaxed),
                })))
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::testing::{eventually, NodeUnderTest};
    use meshbridge_core::host::WebhookRequest;

    #[tokio::test(start_paused = true)]
    async fn test_hello_command() {
        let node = NodeUnderTest::start(&[(ID, json!({ "enabled": true }))]).await;

        node.say(5, "/hello-n1 nice day");
        eventually("greeting sent", || !node.written().is_empty()).await;
        assert_eq!(node.written(), vec!["m@i- Hello !00000005! You said: nice day"]);

        node.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_greeting() {
        let node =
            NodeUnderTest::start(&[(ID, json!({ "enabled": true, "greeting": "Howdy" }))]).await;

        node.say(5, "/hello-n1");
        eventually("greeting sent", || !node.written().is_empty()).await;
        assert_eq!(node.written(), vec!["m@i- Howdy !00000005!"]);

        node.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_route_counts_emergencies() {
        let node = NodeUnderTest::start(&[(ID, json!({ "enabled": true }))]).await;

        node.say(6, "/emergency lost near the lake");
        eventually("ack sent", || !node.written().is_empty()).await;

        let response = node
            .handle
            .call_route(Method::Get, "/example/status", WebhookRequest::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["emergencies"], 1);
        assert_eq!(response.body["greetings"], 0);

        node.stop().await;
    }
}
