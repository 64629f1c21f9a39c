//! Rolling log of mesh traffic
//!
//! Every inbound message and every transmitted request goes to
//! `messages.log` in the plugin's directory, one JSON object per line.
//! When the file passes `max_bytes` it is rotated to `messages.log.1`,
//! shifting older files up to `keep`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use meshbridge_core::scheduler::OutboundRecord;
use meshbridge_core::{
    Capabilities, Capability, MessageEvent, Plugin, PluginContext, PluginMetadata, Target,
};

pub(crate) const ID: &str = "message_log";

const LOG_FILE: &str = "messages.log";
const DEFAULT_MAX_BYTES: u64 = 256 * 1024;
const DEFAULT_KEEP: u64 = 2;

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum Direction {
    In,
    Out,
}

#[derive(Debug, Serialize)]
struct LogEntry<'a> {
    at: DateTime<Utc>,
    direction: Direction,
    node: String,
    channel: Option<u8>,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    machine_origin: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<&'a str>,
}

#[derive(Debug, Clone)]
struct LogSettings {
    path: PathBuf,
    max_bytes: u64,
    keep: u64,
    include_machine: bool,
}

/// Observer that keeps a rolling message log
#[derive(Default)]
pub struct MessageLogPlugin {
    settings: Mutex<Option<LogSettings>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl MessageLogPlugin {
    async fn append(&self, entry: &LogEntry<'_>) -> anyhow::Result<()> {
        let Some(settings) = self.settings.lock().clone() else {
            return Ok(());
        };
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let size = match tokio::fs::metadata(&settings.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if size > 0 && size + line.len() as u64 > settings.max_bytes {
            rotate(&settings.path, settings.keep).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn rotated(path: &Path, n: u64) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

async fn rotate(path: &Path, keep: u64) -> std::io::Result<()> {
    if keep == 0 {
        return tokio::fs::remove_file(path).await;
    }
    for n in (1..keep).rev() {
        let from = rotated(path, n);
        if tokio::fs::try_exists(&from).await? {
            tokio::fs::rename(&from, rotated(path, n + 1)).await?;
        }
    }
    tokio::fs::rename(path, rotated(path, 1)).await
}

#[async_trait]
impl Plugin for MessageLogPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(ID, env!("CARGO_PKG_VERSION"))
            .with_display_name("Message log")
            .with_description("Writes inbound and outbound traffic to a rolling log")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
            .with(Capability::OnMessage)
            .with(Capability::OnSend)
    }

    async fn on_load(&self, ctx: PluginContext) -> anyhow::Result<()> {
        let config = ctx.config();
        let settings = LogSettings {
            path: ctx.data_dir().join(LOG_FILE),
            max_bytes: config["max_bytes"].as_u64().unwrap_or(DEFAULT_MAX_BYTES).max(1),
            keep: config["keep"].as_u64().unwrap_or(DEFAULT_KEEP),
            include_machine: config["include_machine"].as_bool().unwrap_or(true),
        };
        ctx.log(format!("Logging traffic to {}", settings.path.display()));
        *self.settings.lock() = Some(settings);
        Ok(())
    }

    async fn on_unload(&self) -> anyhow::Result<()> {
        self.settings.lock().take();
        Ok(())
    }

    async fn on_message(&self, event: &MessageEvent) -> anyhow::Result<()> {
        let include_machine = self
            .settings
            .lock()
            .as_ref()
            .map(|s| s.include_machine)
            .unwrap_or(false);
        if event.machine_origin && !include_machine {
            return Ok(());
        }

        let message = &event.message;
        self.append(&LogEntry {
            at: message.received_at,
            direction: Direction::In,
            node: message.sender_id.to_string(),
            channel: (!message.is_direct).then_some(message.channel_index),
            text: &message.text,
            machine_origin: Some(event.machine_origin),
            origin: None,
        })
        .await
    }

    async fn on_send(&self, record: &OutboundRecord) -> anyhow::Result<()> {
        let (node, channel) = match record.request.target {
            Target::Broadcast { channel } => ("broadcast".to_string(), Some(channel)),
            Target::Direct { destination } => (destination.to_string(), None),
        };
        self.append(&LogEntry {
            at: record.sent_at,
            direction: Direction::Out,
            node,
            channel,
            text: &record.request.text,
            machine_origin: None,
            origin: Some(&record.request.origin),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::testing::{eventually, read_lines, NodeUnderTest};
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_logs_inbound_and_outbound() {
        let node = NodeUnderTest::start(&[(ID, json!({ "enabled": true }))]).await;
        let log = node.plugin_dir(ID).join(LOG_FILE);

        node.say(3, "good morning");
        node.say(3, "/ping");
        eventually("three entries", || read_lines(&log).len() == 3).await;

        let lines = read_lines(&log);
        assert_eq!(lines[0]["direction"], "in");
        assert_eq!(lines[0]["text"], "good morning");
        assert_eq!(lines[0]["node"], "!00000003");
        assert_eq!(lines[0]["channel"], 1);
        assert_eq!(lines[2]["direction"], "out");
        assert_eq!(lines[2]["text"], "m@i- pong");
        assert_eq!(lines[2]["origin"], "core");

        node.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_machine_traffic_can_be_excluded() {
        let node = NodeUnderTest::start(&[(
            ID,
            json!({ "enabled": true, "include_machine": false }),
        )])
        .await;
        let log = node.plugin_dir(ID).join(LOG_FILE);

        node.say(4, "m@i- beacon #1");
        node.say(5, "hello");
        eventually("human entry", || read_lines(&log).len() == 1).await;
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;

        let lines = read_lines(&log);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["text"], "hello");

        node.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_rotates() {
        let node = NodeUnderTest::start(&[(
            ID,
            json!({ "enabled": true, "max_bytes": 200, "keep": 2 }),
        )])
        .await;
        let dir = node.plugin_dir(ID);
        let log = dir.join(LOG_FILE);

        for i in 0..8 {
            node.say(6, &format!("message number {i} with some padding"));
        }
        eventually("rotated twice", || rotated(&log, 2).exists()).await;
        eventually("last message logged", || {
            read_lines(&log)
                .iter()
                .any(|l| l["text"] == "message number 7 with some padding")
        })
        .await;

        assert!(!rotated(&log, 3).exists());
        for path in [log.clone(), rotated(&log, 1), rotated(&log, 2)] {
            assert!(std::fs::metadata(&path).unwrap().len() <= 200);
        }

        node.stop().await;
    }
}
