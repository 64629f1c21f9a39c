//! Periodic beacon
//!
//! Broadcasts a short announcement on a fixed interval. Beacons carry the
//! machine marker so other bridges never answer them. The running count is
//! persisted in the plugin's configuration and survives restarts.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use meshbridge_core::{Capabilities, Plugin, PluginContext, PluginMetadata};

pub(crate) const ID: &str = "beacon";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct BeaconSettings {
    interval: String,
    channel: u8,
    text: String,
    count: u64,
}

impl Default for BeaconSettings {
    fn default() -> Self {
        Self {
            interval: "15m".to_string(),
            channel: 0,
            text: "beacon".to_string(),
            count: 0,
        }
    }
}

/// Background poller broadcasting a numbered beacon
#[derive(Default)]
pub struct BeaconPlugin;

async fn beat(ctx: &PluginContext, text: &str, channel: u8) -> anyhow::Result<u64> {
    let updated = ctx
        .update_config(|config| {
            let next = config["count"].as_u64().unwrap_or(0) + 1;
            config["count"] = next.into();
        })
        .await?;
    let count = updated["count"].as_u64().unwrap_or(0);

    let host = ctx.host();
    let message = format!(
        "{}{} #{} from {}",
        host.machine_marker, text, count, host.node_name
    );
    ctx.send_to_mesh(message, Some(channel), None)?;
    Ok(count)
}

#[async_trait]
impl Plugin for BeaconPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(ID, env!("CARGO_PKG_VERSION"))
            .with_display_name("Beacon")
            .with_description("Broadcasts a periodic numbered beacon")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    async fn on_load(&self, ctx: PluginContext) -> anyhow::Result<()> {
        let settings: BeaconSettings = serde_json::from_value(ctx.config())?;
        let interval: Duration = humantime::parse_duration(&settings.interval)?;
        anyhow::ensure!(!interval.is_zero(), "beacon interval must be positive");

        ctx.log(format!(
            "Beacon every {} on channel {}, {} sent so far",
            settings.interval, settings.channel, settings.count
        ));

        let beat_ctx = ctx.clone();
        ctx.spawn_periodic("beacon", interval, move || {
            let ctx = beat_ctx.clone();
            let text = settings.text.clone();
            let channel = settings.channel;
            async move {
                match beat(&ctx, &text, channel).await {
                    Ok(count) => ctx.log(format!("Beacon #{} queued", count)),
                    Err(e) => ctx.log_warning(format!("Beacon failed: {}", e)),
                }
            }
        });
        Ok(())
    }

    async fn on_unload(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
