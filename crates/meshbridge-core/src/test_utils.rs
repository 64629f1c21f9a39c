//! Test utilities
//!
//! Mock transports and recording plugins for exercising the bridge without
//! a radio.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshbridge_core::test_utils::{text_frame, MockTransport};
//!
//! let (transport, link) = MockTransport::new("radio");
//! // hand `transport` to the connection manager, then drive it through `link`
//! link.inject(text_frame(NodeId(9), NodeId::BROADCAST, 1, "hello"));
//! link.set_healthy(false); // the next read fails, connects are refused
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::command::Command;
use crate::error::{BridgeError, Result};
use crate::frame::{Port, RadioFrame};
use crate::host::context::{PluginContext, PLUGIN_CONFIG_FILE};
use crate::host::plugin::{
    Capabilities, Capability, EmergencyAlert, MessageEvent, Plugin, PluginMetadata,
};
use crate::message::{InboundMessage, NodeId};
use crate::scheduler::{OutboundRecord, Ticket};
use crate::transport::Transport;

/// Encode a text frame
pub fn text_frame(from: NodeId, to: NodeId, channel: u8, text: &str) -> Bytes {
    RadioFrame::text(from, to, channel, text).encode()
}

/// Create `root/name/config.json` holding `config`
pub fn write_plugin_dir(root: &Path, name: &str, config: serde_json::Value) -> std::io::Result<PathBuf> {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(PLUGIN_CONFIG_FILE), config.to_string())?;
    Ok(dir)
}

// ============================================================================
// Mock transport
// ============================================================================

struct LinkShared {
    healthy: watch::Sender<bool>,
    probes_fail: AtomicBool,
    connected: AtomicBool,
    connect_attempts: AtomicUsize,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    written: Mutex<Vec<Bytes>>,
}

/// Control handle for a [`MockTransport`]
#[derive(Clone)]
pub struct MockLink {
    shared: Arc<LinkShared>,
}

impl MockLink {
    /// Queue a frame for the transport to read
    pub fn inject(&self, frame: Bytes) {
        let _ = self.shared.inbound_tx.send(frame);
    }

    /// An unhealthy link refuses connects, fails reads and writes
    pub fn set_healthy(&self, healthy: bool) {
        self.shared.healthy.send_replace(healthy);
    }

    /// Fail probes while reads keep blocking
    pub fn fail_probes(&self, fail: bool) {
        self.shared.probes_fail.store(fail, Ordering::SeqCst);
    }

    /// Connect calls seen so far
    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Whether the transport is open
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Raw frames written
    pub fn written(&self) -> Vec<Bytes> {
        self.shared.written.lock().clone()
    }

    /// Text frames written, as (destination, channel, text)
    pub fn written_texts(&self) -> Vec<(NodeId, u8, String)> {
        self.written()
            .iter()
            .filter_map(|raw| RadioFrame::decode(raw).ok())
            .filter(|frame| frame.port == Port::Text)
            .filter_map(|frame| {
                let text = frame.text_payload().ok()?.to_string();
                Some((frame.to, frame.channel, text))
            })
            .collect()
    }
}

/// In-memory transport driven by a [`MockLink`]
pub struct MockTransport {
    name: String,
    shared: Arc<LinkShared>,
    inbound_rx: mpsc::UnboundedReceiver<Bytes>,
    health_rx: watch::Receiver<bool>,
}

impl MockTransport {
    /// A healthy, disconnected transport and its control handle
    pub fn new(name: impl Into<String>) -> (Self, MockLink) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (healthy, health_rx) = watch::channel(true);
        let shared = Arc::new(LinkShared {
            healthy,
            probes_fail: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connect_attempts: AtomicUsize::new(0),
            inbound_tx,
            written: Mutex::new(Vec::new()),
        });
        let transport = Self {
            name: name.into(),
            shared: shared.clone(),
            inbound_rx,
            health_rx,
        };
        (transport, MockLink { shared })
    }

    fn healthy(&self) -> bool {
        *self.health_rx.borrow()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.healthy() {
            return Err(BridgeError::OpenFailed {
                transport: self.name.clone(),
                reason: "mock link is down".to_string(),
            });
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }
        if !self.healthy() {
            return Err(BridgeError::ReadError("mock link is down".to_string()));
        }

        let health_rx = &mut self.health_rx;
        let went_down = async { health_rx.wait_for(|healthy| !*healthy).await.is_ok() };
        tokio::select! {
            frame = self.inbound_rx.recv() => frame.map(Some).ok_or(BridgeError::Disconnected),
            _ = went_down => Err(BridgeError::ReadError("mock link is down".to_string())),
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if !self.is_connected() || !self.healthy() {
            return Err(BridgeError::WriteError("mock link is down".to_string()));
        }
        self.shared.written.lock().push(Bytes::copy_from_slice(frame));
        Ok(())
    }

    async fn probe(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }
        if !self.healthy() || self.shared.probes_fail.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectionTimeout { duration_ms: 0 });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Recording plugins
// ============================================================================

/// Something a [`RecordingPlugin`] saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    /// `on_load`
    Loaded,
    /// `on_unload`
    Unloaded,
    /// `on_message`
    Message {
        /// Message text
        text: String,
        /// Whether it was flagged machine-origin
        machine_origin: bool,
    },
    /// `on_command`
    Command {
        /// Command name
        name: String,
        /// Arguments
        args: String,
    },
    /// `on_emergency`, with the alert text
    Emergency(String),
    /// `on_send`, with the request text
    Sent(String),
    /// Ticket returned for a send made from `on_message`
    Ticketed(Ticket),
}

/// Shared log of hook invocations
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Seen>>>,
}

impl Recorder {
    fn push(&self, seen: Seen) {
        self.events.lock().push(seen);
    }

    /// Everything, in order
    pub fn events(&self) -> Vec<Seen> {
        self.events.lock().clone()
    }

    /// Observed messages as (text, machine_origin)
    pub fn messages(&self) -> Vec<(String, bool)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Seen::Message { text, machine_origin } => Some((text, machine_origin)),
                _ => None,
            })
            .collect()
    }

    /// Names of commands offered
    pub fn commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Seen::Command { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Alert texts received
    pub fn emergencies(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Seen::Emergency(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Mirrored outbound texts
    pub fn sent(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Seen::Sent(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Tickets of sends made from `on_message`
    pub fn tickets(&self) -> Vec<Ticket> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Seen::Ticketed(ticket) => Some(ticket),
                _ => None,
            })
            .collect()
    }

    /// Number of `on_unload` calls
    pub fn unloads(&self) -> usize {
        self.events().iter().filter(|e| **e == Seen::Unloaded).count()
    }
}

/// Configurable plugin that records every hook call.
///
/// Declares `onMessage`, `onEmergency` and `onSend` by default; adding a
/// command or reply also declares `onCommand`.
pub struct RecordingPlugin {
    id: String,
    capabilities: Capabilities,
    commands: BTreeMap<String, String>,
    replies: HashMap<String, String>,
    catch_all: Option<String>,
    failing: bool,
    panicking: bool,
    delay: Option<Duration>,
    send_on_message: Option<String>,
    recorder: Recorder,
    ctx: Mutex<Option<PluginContext>>,
}

impl RecordingPlugin {
    /// A well-behaved plugin with id `id`
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: Capabilities::NONE
                .with(Capability::OnMessage)
                .with(Capability::OnEmergency)
                .with(Capability::OnSend),
            commands: BTreeMap::new(),
            replies: HashMap::new(),
            catch_all: None,
            failing: false,
            panicking: false,
            delay: None,
            send_on_message: None,
            recorder: Recorder::default(),
            ctx: Mutex::new(None),
        }
    }

    /// Replace the declared capabilities
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Declare a command without answering it
    pub fn with_command(mut self, name: &str, description: &str) -> Self {
        self.commands.insert(name.to_string(), description.to_string());
        self.capabilities = self.capabilities.with(Capability::OnCommand);
        self
    }

    /// Declare a command and answer it with `reply`
    pub fn with_reply(mut self, name: &str, reply: &str) -> Self {
        self.replies.insert(name.to_string(), reply.to_string());
        self.with_command(name, &format!("replies {reply}"))
    }

    /// Answer every command offered
    pub fn with_catch_all(mut self, reply: &str) -> Self {
        self.catch_all = Some(reply.to_string());
        self.capabilities = self.capabilities.with(Capability::OnCommand);
        self
    }

    /// Every dispatch hook returns an error
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Every dispatch hook panics
    pub fn panicking(mut self) -> Self {
        self.panicking = true;
        self.capabilities = self.capabilities.with(Capability::OnCommand);
        self
    }

    /// Every dispatch hook sleeps for `delay` first
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Send `text` to the mesh from `on_message`
    pub fn sending_on_message(mut self, text: &str) -> Self {
        self.send_on_message = Some(text.to_string());
        self
    }

    /// Record into `recorder`
    pub fn with_recorder(mut self, recorder: Recorder) -> Self {
        self.recorder = recorder;
        self
    }

    /// The recorder in use
    pub fn recorder(&self) -> Recorder {
        self.recorder.clone()
    }

    async fn misbehave(&self, hook: &str) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panicking {
            panic!("{} panicked in {}", self.id, hook);
        }
        if self.failing {
            anyhow::bail!("{} failed in {}", self.id, hook);
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(self.id.clone(), "0.1.0").with_description("records hook calls")
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn commands(&self) -> BTreeMap<String, String> {
        self.commands.clone()
    }

    async fn on_load(&self, ctx: PluginContext) -> anyhow::Result<()> {
        self.recorder.push(Seen::Loaded);
        *self.ctx.lock() = Some(ctx);
        Ok(())
    }

    async fn on_unload(&self) -> anyhow::Result<()> {
        self.recorder.push(Seen::Unloaded);
        self.ctx.lock().take();
        Ok(())
    }

    async fn on_message(&self, event: &MessageEvent) -> anyhow::Result<()> {
        self.misbehave("onMessage").await?;
        self.recorder.push(Seen::Message {
            text: event.message.text.clone(),
            machine_origin: event.machine_origin,
        });
        if let Some(text) = &self.send_on_message {
            let ctx = self.ctx.lock().clone();
            if let Some(ctx) = ctx {
                let outcome =
                    ctx.send_to_mesh(text.clone(), Some(event.message.channel_index), None)?;
                self.recorder.push(Seen::Ticketed(outcome.ticket()));
            }
        }
        Ok(())
    }

    async fn on_command(
        &self,
        command: &Command,
        _message: &InboundMessage,
    ) -> anyhow::Result<Option<String>> {
        self.misbehave("onCommand").await?;
        self.recorder.push(Seen::Command {
            name: command.name.clone(),
            args: command.args.clone(),
        });
        Ok(self
            .replies
            .get(&command.name)
            .cloned()
            .or_else(|| self.catch_all.clone()))
    }

    async fn on_emergency(&self, alert: &EmergencyAlert) -> anyhow::Result<()> {
        self.misbehave("onEmergency").await?;
        self.recorder.push(Seen::Emergency(alert.text.clone()));
        Ok(())
    }

    async fn on_send(&self, record: &OutboundRecord) -> anyhow::Result<()> {
        self.misbehave("onSend").await?;
        self.recorder.push(Seen::Sent(record.request.text.clone()));
        Ok(())
    }
}

/// Plugin whose teardown never finishes
#[derive(Debug, Default)]
pub struct HangingPlugin;

impl HangingPlugin {
    /// Create one
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Plugin for HangingPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("hang", "0.1.0")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    async fn on_unload(&self) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Plugin with a background poller that broadcasts `tick` every interval
pub struct PollingPlugin {
    interval: Duration,
    sends: Arc<AtomicUsize>,
}

impl PollingPlugin {
    /// Poll every `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            sends: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Count successful sends into `counter`
    pub fn with_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.sends = counter;
        self
    }

    /// Successful sends so far
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Plugin for PollingPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("poller", "0.1.0")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    async fn on_load(&self, ctx: PluginContext) -> anyhow::Result<()> {
        let sends = self.sends.clone();
        let poll_ctx = ctx.clone();
        ctx.spawn_periodic("poll", self.interval, move || {
            let ctx = poll_ctx.clone();
            let sends = sends.clone();
            async move {
                if ctx.send_to_mesh("tick", None, None).is_ok() {
                    sends.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        Ok(())
    }

    async fn on_unload(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_reads_injected_frames() {
        let (mut transport, link) = MockTransport::new("mock");
        assert!(transport.read_frame().await.is_err());

        transport.connect().await.unwrap();
        link.inject(text_frame(NodeId(1), NodeId::BROADCAST, 2, "hey"));
        let raw = transport.read_frame().await.unwrap().unwrap();
        let frame = RadioFrame::decode(&raw).unwrap();
        assert_eq!(frame.text_payload().unwrap(), "hey");

        transport.write_frame(&raw).await.unwrap();
        assert_eq!(link.written_texts(), vec![(NodeId::BROADCAST, 2, "hey".to_string())]);
    }

    #[tokio::test]
    async fn test_unhealthy_link_fails_pending_read() {
        let (mut transport, link) = MockTransport::new("mock");
        transport.connect().await.unwrap();

        let reader = tokio::spawn(async move { transport.read_frame().await });
        tokio::task::yield_now().await;
        link.set_healthy(false);
        assert!(reader.await.unwrap().is_err());
    }
}
