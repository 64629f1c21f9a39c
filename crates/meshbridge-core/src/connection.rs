//! Connection manager - owner of the radio link
//!
//! The manager runs as a single task that owns every configured transport
//! and keeps at most one of them connected. Other components talk to it
//! through a cloneable [`ConnectionHandle`] and learn about connectivity
//! only through [`LinkState`] transitions.
//!
//! # State machine
//!
//! ```text
//!                 connect()
//!  Disconnected ─────────────► Connecting ──all failed──► Reconnecting
//!       ▲                          │                        │    ▲
//!       │ disconnect()             │ first transport ok     │    │ backoff
//!       │                          ▼                        │    │ elapsed
//!       └──────────────────── Connected ◄───────────────────┘────┘
//!                               │   ▲
//!                 probe/write   │   │ traffic or probe ok
//!                 failure       ▼   │
//!                              Degraded ──threshold──► Reconnecting
//! ```
//!
//! `Fatal` is entered only when the manager is built without transports.
//! Transport failures never surface as errors to callers; only `send()`
//! reports whether a frame went out.

use bytes::Bytes;
use chrono::Utc;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::{BridgeConfig, LivenessConfig, ReconnectConfig};
use crate::error::{BridgeError, Result};
use crate::frame::{Port, RadioFrame};
use crate::message::{Coordinates, InboundMessage, NodeId, Target};
use crate::transport::Transport;

/// Number of recent (sender, packet id) pairs remembered to drop rebroadcasts
const RECENT_PACKETS: usize = 256;

/// Inbound queue depth between the manager and the dispatcher
const INBOUND_QUEUE: usize = 256;

/// Connectivity of the radio link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Not connected and not trying
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Link is up
    Connected,
    /// Link is up but recent probes or writes failed
    Degraded,
    /// Link lost; retrying with backoff
    Reconnecting,
    /// Configuration cannot produce a link
    Fatal,
}

impl LinkState {
    /// Whether frames can be written in this state
    pub fn is_usable(&self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Degraded)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Degraded => write!(f, "degraded"),
            LinkState::Reconnecting => write!(f, "reconnecting"),
            LinkState::Fatal => write!(f, "fatal"),
        }
    }
}

/// Bounded exponential backoff, reset on success
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    /// Create from reconnect configuration
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: config.initial_delay,
            max: config.max_delay.max(config.initial_delay),
            multiplier: config.multiplier.max(1),
            current: config.initial_delay,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        self.attempts += 1;
        delay
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Back to the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

/// What the bridge knows about a mesh node
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct NodeEntry {
    /// Short name
    pub short_name: Option<String>,
    /// Long name
    pub long_name: Option<String>,
    /// Last reported position
    pub position: Option<Coordinates>,
}

/// Names and positions learned from node-info and position frames
#[derive(Debug, Clone, Default)]
pub struct NodeDirectory {
    nodes: Arc<RwLock<HashMap<NodeId, NodeEntry>>>,
}

impl NodeDirectory {
    /// Look up a node
    pub fn get(&self, id: NodeId) -> Option<NodeEntry> {
        self.nodes.read().get(&id).cloned()
    }

    /// Number of known nodes
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether no node is known
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    fn set_names(&self, id: NodeId, short: String, long: String) {
        let mut nodes = self.nodes.write();
        let entry = nodes.entry(id).or_default();
        entry.short_name = Some(short);
        entry.long_name = Some(long);
    }

    fn set_position(&self, id: NodeId, position: Coordinates) {
        self.nodes.write().entry(id).or_default().position = Some(position);
    }
}

/// Link counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LinkStats {
    /// Frames read from the radio
    pub frames_received: u64,
    /// Frames written to the radio
    pub frames_sent: u64,
    /// Text messages handed to the dispatcher
    pub messages_delivered: u64,
    /// Malformed frames dropped
    pub protocol_errors: u64,
    /// Rebroadcast copies dropped
    pub duplicates_dropped: u64,
    /// Successful reconnects after a lost link
    pub reconnects: u64,
    /// Transport failures observed
    pub transport_failures: u64,
}

/// Commands accepted by the manager task
#[derive(Debug)]
enum LinkCommand {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Send {
        frame: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Handle for talking to the connection manager
#[derive(Clone)]
pub struct ConnectionHandle {
    command_tx: mpsc::Sender<LinkCommand>,
    state_rx: watch::Receiver<LinkState>,
    active: Arc<RwLock<Option<String>>>,
    stats: Arc<Mutex<LinkStats>>,
    nodes: NodeDirectory,
}

impl ConnectionHandle {
    /// Current link state
    pub fn current_state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Subscribe to link state transitions
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Name of the connected transport
    pub fn active_transport(&self) -> Option<String> {
        self.active.read().clone()
    }

    /// Snapshot of link counters
    pub fn stats(&self) -> LinkStats {
        self.stats.lock().clone()
    }

    /// Known mesh nodes
    pub fn nodes(&self) -> &NodeDirectory {
        &self.nodes
    }

    /// Ask the manager to bring the link up.
    ///
    /// Returns once the request is accepted; watch [`LinkState`] for the
    /// outcome. Fails only when the manager is in `Fatal`.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(LinkCommand::Connect(tx))
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await?
    }

    /// Take the link down and stop reconnecting
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(LinkCommand::Disconnect(tx))
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)
    }

    /// Write a raw radio frame
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(LinkCommand::Send { frame, reply: tx })
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await?
    }

    /// Encode and write one text frame
    pub async fn send_text(&self, target: Target, text: &str) -> Result<()> {
        let (to, channel) = match target {
            Target::Broadcast { channel } => (NodeId::BROADCAST, channel),
            Target::Direct { destination } => (destination, 0),
        };
        // The radio stamps its own node id on outgoing frames
        let frame = RadioFrame::text(NodeId(0), to, channel, text);
        self.send(frame.encode()).await
    }

    /// Wait until the link is usable or `timeout` elapses
    pub async fn wait_until_usable(&self, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| s.is_usable()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Stop the manager task
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(LinkCommand::Shutdown)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

/// Outcome of handling a command
enum Flow {
    Continue,
    StateChanged,
    Stop,
}

/// The connection manager task
pub struct ConnectionManager {
    transports: Vec<Box<dyn Transport>>,
    active: Option<usize>,
    state_tx: watch::Sender<LinkState>,
    command_rx: mpsc::Receiver<LinkCommand>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    backoff: Backoff,
    reconnect: ReconnectConfig,
    liveness: LivenessConfig,
    consecutive_failures: u32,
    was_connected: bool,
    active_name: Arc<RwLock<Option<String>>>,
    stats: Arc<Mutex<LinkStats>>,
    nodes: NodeDirectory,
    recent: LruCache<(NodeId, u32), ()>,
}

impl ConnectionManager {
    /// Create a manager for `transports`, tried in the given order.
    ///
    /// Returns the manager (to be run), its handle and the stream of
    /// inbound messages.
    pub fn new(
        config: &BridgeConfig,
        transports: Vec<Box<dyn Transport>>,
    ) -> (Self, ConnectionHandle, mpsc::Receiver<InboundMessage>) {
        let initial = if transports.is_empty() {
            error!("No transport configured; link is unusable");
            LinkState::Fatal
        } else {
            LinkState::Disconnected
        };

        let (state_tx, state_rx) = watch::channel(initial);
        let (command_tx, command_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let active_name = Arc::new(RwLock::new(None));
        let stats = Arc::new(Mutex::new(LinkStats::default()));
        let nodes = NodeDirectory::default();

        let handle = ConnectionHandle {
            command_tx,
            state_rx,
            active: active_name.clone(),
            stats: stats.clone(),
            nodes: nodes.clone(),
        };

        let manager = Self {
            transports,
            active: None,
            state_tx,
            command_rx,
            inbound_tx,
            backoff: Backoff::new(&config.reconnect),
            reconnect: config.reconnect.clone(),
            liveness: config.liveness.clone(),
            consecutive_failures: 0,
            was_connected: false,
            active_name,
            stats,
            nodes,
            recent: LruCache::new(NonZeroUsize::new(RECENT_PACKETS).unwrap_or(NonZeroUsize::MIN)),
        };

        (manager, handle, inbound_rx)
    }

    fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: LinkState) {
        let prev = self.state();
        if prev == next {
            return;
        }
        match next {
            LinkState::Connected => info!(from = %prev, to = %next, "Link state changed"),
            LinkState::Disconnected | LinkState::Connecting => {
                info!(from = %prev, to = %next, "Link state changed")
            }
            LinkState::Degraded | LinkState::Reconnecting => {
                warn!(from = %prev, to = %next, "Link state changed")
            }
            LinkState::Fatal => error!(from = %prev, to = %next, "Link state changed"),
        }
        self.state_tx.send_replace(next);
    }

    /// Run the manager until shutdown
    pub async fn run(mut self) -> Result<()> {
        info!(transports = self.transports.len(), "Starting connection manager");

        loop {
            let flow = match self.state() {
                LinkState::Connected | LinkState::Degraded => self.serve_connected().await,
                LinkState::Connecting | LinkState::Reconnecting => self.connect_round().await,
                LinkState::Disconnected | LinkState::Fatal => self.idle().await,
            };
            if let Flow::Stop = flow {
                break;
            }
        }

        self.release_active().await;
        info!("Connection manager stopped");
        Ok(())
    }

    /// Wait for commands while no link is wanted
    async fn idle(&mut self) -> Flow {
        loop {
            match self.command_rx.recv().await {
                Some(cmd) => match self.handle_command(cmd).await {
                    Flow::Continue => continue,
                    other => return other,
                },
                None => return Flow::Stop,
            }
        }
    }

    /// Try every transport once in priority order; on total failure wait
    /// out the backoff while still answering commands
    async fn connect_round(&mut self) -> Flow {
        let attempted = self.transports.len();
        for idx in 0..attempted {
            let name = self.transports[idx].name().to_string();
            debug!(transport = %name, "Trying transport");
            match self.transports[idx].connect().await {
                Ok(()) => {
                    self.active = Some(idx);
                    *self.active_name.write() = Some(name.clone());
                    self.backoff.reset();
                    self.consecutive_failures = 0;
                    if self.was_connected {
                        self.stats.lock().reconnects += 1;
                    }
                    self.was_connected = true;
                    info!(transport = %name, "Link established");
                    self.set_state(LinkState::Connected);
                    return Flow::StateChanged;
                }
                Err(e) => {
                    self.stats.lock().transport_failures += 1;
                    warn!(transport = %name, error = %e, code = e.error_code(), "Transport failed to connect");
                }
            }
        }

        let err = BridgeError::AllTransportsFailed { attempted };
        let exhausted = self.reconnect.max_attempts > 0
            && self.backoff.attempts() >= self.reconnect.max_attempts;
        if !self.reconnect.enabled || exhausted {
            warn!(error = %err, "Giving up on the link");
            self.backoff.reset();
            self.set_state(LinkState::Disconnected);
            return Flow::StateChanged;
        }

        let delay = self.backoff.next_delay();
        warn!(error = %err, retry_in = ?delay, "Retrying after backoff");
        self.set_state(LinkState::Reconnecting);

        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Flow::Continue,
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => match self.handle_command(cmd).await {
                        Flow::Continue => {}
                        other => return other,
                    },
                    None => return Flow::Stop,
                },
            }
        }
    }

    /// Pump frames, commands and liveness probes while a link is up
    async fn serve_connected(&mut self) -> Flow {
        let Some(idx) = self.active else {
            self.set_state(LinkState::Reconnecting);
            return Flow::StateChanged;
        };

        let period = self.liveness.interval.max(Duration::from_millis(10));
        let mut probe = tokio::time::interval_at(Instant::now() + period, period);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                read = self.transports[idx].read_frame() => match read {
                    Ok(Some(bytes)) => {
                        self.mark_alive();
                        self.handle_frame(&bytes).await;
                    }
                    Ok(None) => {
                        trace!("No frame available");
                        tokio::task::yield_now().await;
                    }
                    Err(e) if e.is_protocol_error() => {
                        self.stats.lock().protocol_errors += 1;
                        warn!(error = %e, "Dropping malformed stream data");
                    }
                    Err(e) => {
                        self.link_lost(&e).await;
                        return Flow::StateChanged;
                    }
                },

                cmd = self.command_rx.recv() => match cmd {
                    Some(LinkCommand::Send { frame, reply }) => {
                        let result = self.transports[idx].write_frame(&frame).await;
                        match &result {
                            Ok(()) => {
                                self.stats.lock().frames_sent += 1;
                                self.mark_alive();
                            }
                            Err(e) => {
                                warn!(error = %e, "Frame write failed");
                                let _ = reply.send(Err(BridgeError::WriteError(e.to_string())));
                                if self.record_failure(e).await {
                                    return Flow::StateChanged;
                                }
                                continue;
                            }
                        }
                        let _ = reply.send(result);
                    }
                    Some(cmd) => match self.handle_command(cmd).await {
                        Flow::Continue => {}
                        other => return other,
                    },
                    None => return Flow::Stop,
                },

                _ = probe.tick() => {
                    let probe_timeout = self.liveness.probe_timeout;
                    let outcome = tokio::time::timeout(probe_timeout, self.transports[idx].probe()).await;
                    match outcome {
                        Ok(Ok(())) => {
                            trace!("Liveness probe ok");
                            self.mark_alive();
                        }
                        Ok(Err(e)) => {
                            if self.record_failure(&e).await {
                                return Flow::StateChanged;
                            }
                        }
                        Err(_) => {
                            let e = BridgeError::ConnectionTimeout {
                                duration_ms: probe_timeout.as_millis() as u64,
                            };
                            if self.record_failure(&e).await {
                                return Flow::StateChanged;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Commands that behave the same in every state. Sends outside the
    /// connected states fail immediately.
    async fn handle_command(&mut self, cmd: LinkCommand) -> Flow {
        match cmd {
            LinkCommand::Connect(reply) => {
                if self.state() == LinkState::Fatal {
                    let _ = reply.send(Err(BridgeError::MissingConfig("transports".to_string())));
                    return Flow::Continue;
                }
                let _ = reply.send(Ok(()));
                if self.state() == LinkState::Disconnected {
                    self.set_state(LinkState::Connecting);
                    return Flow::StateChanged;
                }
                Flow::Continue
            }
            LinkCommand::Disconnect(reply) => {
                self.release_active().await;
                self.backoff.reset();
                if self.state() != LinkState::Fatal {
                    self.set_state(LinkState::Disconnected);
                }
                let _ = reply.send(());
                Flow::StateChanged
            }
            LinkCommand::Send { reply, .. } => {
                let err = if self.state() == LinkState::Fatal {
                    BridgeError::MissingConfig("transports".to_string())
                } else {
                    BridgeError::Disconnected
                };
                let _ = reply.send(Err(err));
                Flow::Continue
            }
            LinkCommand::Shutdown => {
                info!("Connection manager shutdown requested");
                Flow::Stop
            }
        }
    }

    fn mark_alive(&mut self) {
        self.consecutive_failures = 0;
        if self.state() == LinkState::Degraded {
            self.set_state(LinkState::Connected);
        }
    }

    /// Count a link failure. Returns true when the link was dropped.
    async fn record_failure(&mut self, error: &BridgeError) -> bool {
        self.consecutive_failures += 1;
        self.stats.lock().transport_failures += 1;

        let still_open = self
            .active
            .map(|idx| self.transports[idx].is_connected())
            .unwrap_or(false);
        if !still_open || self.consecutive_failures >= self.liveness.degraded_threshold.max(1) {
            self.link_lost(error).await;
            return true;
        }

        warn!(
            error = %error,
            failures = self.consecutive_failures,
            "Link degraded"
        );
        self.set_state(LinkState::Degraded);
        false
    }

    async fn link_lost(&mut self, error: &BridgeError) {
        let name = self.active_name.read().clone().unwrap_or_default();
        warn!(transport = %name, error = %error, code = error.error_code(), "Link lost");
        self.release_active().await;
        if self.reconnect.enabled {
            self.set_state(LinkState::Reconnecting);
        } else {
            self.set_state(LinkState::Disconnected);
        }
    }

    async fn release_active(&mut self) {
        if let Some(idx) = self.active.take() {
            if let Err(e) = self.transports[idx].disconnect().await {
                warn!(error = %e, "Error disconnecting transport");
            }
        }
        *self.active_name.write() = None;
        self.consecutive_failures = 0;
    }

    /// Decode a frame and route it: text becomes an inbound message,
    /// position and node-info update the directory
    async fn handle_frame(&mut self, bytes: &[u8]) {
        self.stats.lock().frames_received += 1;

        let frame = match RadioFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.lock().protocol_errors += 1;
                warn!(error = %e, size = bytes.len(), "Dropping malformed frame");
                return;
            }
        };

        if frame.packet_id != 0 && self.recent.put((frame.from, frame.packet_id), ()).is_some() {
            self.stats.lock().duplicates_dropped += 1;
            debug!(from = %frame.from, packet_id = frame.packet_id, "Dropping rebroadcast copy");
            return;
        }

        match frame.port {
            Port::Text => match self.build_message(&frame) {
                Ok(message) => {
                    debug!(from = %message.sender_id, channel = message.channel_index, direct = message.is_direct, "Inbound text");
                    if self.inbound_tx.send(message).await.is_ok() {
                        self.stats.lock().messages_delivered += 1;
                    } else {
                        trace!("Inbound receiver dropped");
                    }
                }
                Err(e) => {
                    self.stats.lock().protocol_errors += 1;
                    warn!(error = %e, from = %frame.from, "Dropping undecodable text frame");
                }
            },
            Port::Position => match frame.position_payload() {
                Ok(position) => {
                    debug!(node = %frame.from, %position, "Position update");
                    self.nodes.set_position(frame.from, position);
                }
                Err(e) => {
                    self.stats.lock().protocol_errors += 1;
                    warn!(error = %e, "Dropping malformed position frame");
                }
            },
            Port::NodeInfo => match frame.node_info_payload() {
                Ok((short, long)) => {
                    debug!(node = %frame.from, short = %short, "Node info update");
                    self.nodes.set_names(frame.from, short, long);
                }
                Err(e) => {
                    self.stats.lock().protocol_errors += 1;
                    warn!(error = %e, "Dropping malformed node-info frame");
                }
            },
            Port::Other(port) => trace!(port, "Ignoring frame on unhandled port"),
        }
    }

    fn build_message(&self, frame: &RadioFrame) -> Result<InboundMessage> {
        let text = frame.text_payload()?;
        let entry = self.nodes.get(frame.from).unwrap_or_default();
        let fallback = frame.from.to_string();
        Ok(InboundMessage {
            sender_id: frame.from,
            sender_short_name: entry.short_name.unwrap_or_else(|| fallback.clone()),
            sender_long_name: entry.long_name.unwrap_or(fallback),
            text: text.to_string(),
            channel_index: frame.channel,
            is_direct: !frame.is_broadcast(),
            received_at: Utc::now(),
            arrived_via_relay: frame.relayed,
            packet_id: frame.packet_id,
            position: entry.position,
        })
    }
}
