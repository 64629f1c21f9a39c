//! Inbound message dispatch
//!
//! Every inbound message passes through the same pipeline:
//!
//! 1. loop prevention (machine marker or recently seen machine sender)
//! 2. command classification against the deployment alias
//! 3. command routing, first non-empty reply wins
//! 4. emergency fan-out to every plugin declaring `onEmergency`
//! 5. observer fan-out to every plugin declaring `onMessage`
//!
//! Hooks run one at a time under [`guarded_call`]. Sends issued from inside
//! a hook are held back and queued after the pipeline finishes, so a hook
//! can never re-enter dispatch. Machine-origin messages still reach
//! observers, but anything sent in response to them is discarded.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::command::{Command, CommandParser};
use crate::config::{BridgeConfig, ResponseConfig};
use crate::host::context::{collect_deferred, DeferredSend};
use crate::host::health::{guarded_call, HookKind, HookLimits};
use crate::host::plugin::{Capability, EmergencyAlert, MessageEvent};
use crate::host::registry::{LoadedPlugin, PluginRegistry};
use crate::message::{InboundMessage, OutboundRequest, Priority};
use crate::scheduler::{OutboundRecord, OutboundScheduler};
use crate::suppression::{MachineOrigin, SeenNodeSuppressionSet};

/// How often expired suppression entries are swept
const SUPPRESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Dispatch counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    /// Inbound messages dispatched
    pub messages: u64,
    /// Messages classified as machine-origin
    pub machine_origin: u64,
    /// Commands recognized
    pub commands: u64,
    /// Commands no handler answered
    pub unclaimed_commands: u64,
    /// Replies queued
    pub replies: u64,
    /// Replies withheld by the reply policy
    pub gated_replies: u64,
    /// Emergency alerts raised
    pub emergencies: u64,
    /// Hook calls that failed
    pub hook_failures: u64,
    /// Deferred sends queued after dispatch
    pub deferred_flushed: u64,
    /// Deferred sends discarded because the trigger was machine-origin
    pub deferred_discarded: u64,
    /// Outbound records mirrored to `onSend`
    pub mirrored: u64,
}

/// What happened to one inbound message
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    /// Set when the message was machine-origin
    pub machine_origin: Option<MachineOrigin>,
    /// Recognized command
    pub command: Option<Command>,
    /// Plugin whose reply was used
    pub responder: Option<String>,
    /// Reply queued for the sender
    pub reply: Option<OutboundRequest>,
    /// A reply was withheld by the reply policy
    pub reply_gated: bool,
    /// `onEmergency` invocations
    pub emergency_hooks: usize,
    /// `onMessage` invocations
    pub observers: usize,
    /// Sends issued by hooks and queued afterwards
    pub flushed: Vec<OutboundRequest>,
    /// Sends issued by hooks and discarded
    pub discarded: usize,
}

/// A command reply and the plugin that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    /// Answering plugin
    pub plugin: String,
    /// Reply text, without the machine marker
    pub text: String,
}

/// Routes inbound messages to plugins
#[derive(Clone)]
pub struct Dispatcher {
    registry: PluginRegistry,
    scheduler: OutboundScheduler,
    parser: CommandParser,
    suppression: SeenNodeSuppressionSet,
    response: ResponseConfig,
    limits: HookLimits,
    stats: Arc<Mutex<DispatchStats>>,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`
    pub fn new(
        config: &BridgeConfig,
        registry: PluginRegistry,
        scheduler: OutboundScheduler,
        limits: HookLimits,
    ) -> Self {
        Self {
            registry,
            scheduler,
            parser: CommandParser::from_config(&config.commands),
            suppression: SeenNodeSuppressionSet::from_config(&config.loop_prevention),
            response: config.response.clone(),
            limits,
            stats: Arc::new(Mutex::new(DispatchStats::default())),
        }
    }

    /// Command parser in use
    pub fn parser(&self) -> &CommandParser {
        &self.parser
    }

    /// Seen-node suppression set
    pub fn suppression(&self) -> &SeenNodeSuppressionSet {
        &self.suppression
    }

    /// Counter snapshot
    pub fn stats(&self) -> DispatchStats {
        self.stats.lock().clone()
    }

    /// Run one inbound message through the pipeline
    pub async fn dispatch(&self, message: InboundMessage) -> DispatchOutcome {
        let mut outcome = DispatchOutcome {
            machine_origin: self.suppression.check(message.sender_id, &message.text),
            command: self.parser.parse(&message.text),
            ..Default::default()
        };
        let human = outcome.machine_origin.is_none();
        self.stats.lock().messages += 1;
        if !human {
            self.stats.lock().machine_origin += 1;
        }

        debug!(
            from = %message.sender_id,
            channel = message.channel_index,
            direct = message.is_direct,
            machine = !human,
            command = outcome.command.as_ref().map(|c| c.name.as_str()).unwrap_or(""),
            "Dispatching message"
        );

        let command = if human { outcome.command.clone() } else { None };
        let may_reply = self.may_reply(&message);

        let (routed, deferred) = collect_deferred(async {
            let mut reply = None;
            let mut emergency_hooks = 0;

            if let Some(cmd) = &command {
                self.stats.lock().commands += 1;
                if may_reply || cmd.emergency {
                    reply = self.dispatch_command(cmd, &message).await;
                    if reply.is_none() {
                        self.stats.lock().unclaimed_commands += 1;
                        debug!(command = %cmd, "No handler answered command");
                    }
                }
                if cmd.emergency {
                    let alert = EmergencyAlert::compose(&message, &cmd.args);
                    emergency_hooks = self.raise_emergency(&alert).await;
                }
            }

            let event = MessageEvent {
                message: message.clone(),
                command: outcome.command.clone(),
                machine_origin: !human,
            };
            let observers = self.notify_observers(&event).await;
            (reply, emergency_hooks, observers)
        })
        .await;

        let (reply, emergency_hooks, observers) = routed;
        outcome.emergency_hooks = emergency_hooks;
        outcome.observers = observers;

        if let Some(cmd) = &command {
            if !may_reply && !cmd.emergency {
                outcome.reply_gated = true;
                self.stats.lock().gated_replies += 1;
                debug!(command = %cmd, "Reply withheld by reply policy");
            }
        }

        if let (Some(cmd), Some(reply)) = (&command, reply) {
            let priority = if cmd.emergency {
                Priority::Emergency
            } else {
                Priority::Normal
            };
            let request = OutboundRequest::reply_to(
                &message,
                format!("{}{}", self.suppression.marker(), reply.text),
            )
            .with_origin(reply.plugin.clone())
            .with_priority(priority);

            if !self.response.reply_delay.is_zero() {
                tokio::time::sleep(self.response.reply_delay).await;
            }
            match self.scheduler.enqueue(request.clone()) {
                Ok(receipt) => {
                    self.stats.lock().replies += 1;
                    debug!(command = %cmd, plugin = %reply.plugin, ticket = %receipt.ticket, "Reply queued");
                    outcome.responder = Some(reply.plugin);
                    outcome.reply = Some(request);
                }
                Err(e) => warn!(command = %cmd, error = %e, "Failed to queue reply"),
            }
        }

        if human {
            outcome.flushed = self.flush(deferred);
        } else if !deferred.is_empty() {
            for send in &deferred {
                self.scheduler.discard(send.ticket);
            }
            outcome.discarded = deferred.len();
            self.stats.lock().deferred_discarded += deferred.len() as u64;
            debug!(
                from = %message.sender_id,
                count = deferred.len(),
                "Discarded sends triggered by machine-origin message"
            );
        }

        outcome
    }

    /// Ask command handlers for a reply.
    ///
    /// The plugin owning the command name is asked first, then every other
    /// `onCommand` plugin in registration order. The first non-empty reply
    /// wins.
    pub async fn dispatch_command(
        &self,
        command: &Command,
        message: &InboundMessage,
    ) -> Option<CommandReply> {
        let owner = self.registry.command_owner(&command.name);
        let mut handlers: Vec<Arc<LoadedPlugin>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|p| p.accepts(Capability::OnCommand))
            .collect();
        if let Some(owner) = owner {
            if let Some(pos) = handlers.iter().position(|p| p.id() == owner) {
                let first = handlers.remove(pos);
                handlers.insert(0, first);
            }
        }

        for plugin in handlers {
            let result = guarded_call(
                plugin.id(),
                HookKind::OnCommand,
                &plugin.stats,
                self.limits,
                plugin.plugin.on_command(command, message),
            )
            .await;
            match result {
                Ok(Some(text)) if !text.trim().is_empty() => {
                    trace!(command = %command, plugin = %plugin.id(), "Command answered");
                    return Some(CommandReply {
                        plugin: plugin.id().to_string(),
                        text,
                    });
                }
                Ok(_) => {}
                Err(_) => self.stats.lock().hook_failures += 1,
            }
        }
        None
    }

    async fn raise_emergency(&self, alert: &EmergencyAlert) -> usize {
        self.stats.lock().emergencies += 1;
        warn!(
            from = %alert.sender_id,
            name = %alert.sender_short_name,
            located = alert.coordinates.is_some(),
            "Emergency alert raised"
        );

        let mut invoked = 0;
        for plugin in self.registry.snapshot() {
            if !plugin.accepts(Capability::OnEmergency) {
                continue;
            }
            invoked += 1;
            let result = guarded_call(
                plugin.id(),
                HookKind::OnEmergency,
                &plugin.stats,
                self.limits,
                plugin.plugin.on_emergency(alert),
            )
            .await;
            if result.is_err() {
                self.stats.lock().hook_failures += 1;
            }
        }
        invoked
    }

    async fn notify_observers(&self, event: &MessageEvent) -> usize {
        let mut invoked = 0;
        for plugin in self.registry.snapshot() {
            if !plugin.accepts(Capability::OnMessage) {
                continue;
            }
            invoked += 1;
            let result = guarded_call(
                plugin.id(),
                HookKind::OnMessage,
                &plugin.stats,
                self.limits,
                plugin.plugin.on_message(event),
            )
            .await;
            if result.is_err() {
                self.stats.lock().hook_failures += 1;
            }
        }
        invoked
    }

    /// Fan a transmitted request out to `onSend`, skipping its origin
    pub async fn mirror_sent(&self, record: &OutboundRecord) -> usize {
        let (invoked, deferred) = collect_deferred(async {
            let mut invoked = 0;
            for plugin in self.registry.snapshot() {
                if !plugin.accepts(Capability::OnSend) || plugin.id() == record.request.origin {
                    continue;
                }
                invoked += 1;
                let result = guarded_call(
                    plugin.id(),
                    HookKind::OnSend,
                    &plugin.stats,
                    self.limits,
                    plugin.plugin.on_send(record),
                )
                .await;
                if result.is_err() {
                    self.stats.lock().hook_failures += 1;
                }
            }
            invoked
        })
        .await;

        self.stats.lock().mirrored += 1;
        self.flush(deferred);
        invoked
    }

    fn flush(&self, deferred: Vec<DeferredSend>) -> Vec<OutboundRequest> {
        let mut flushed = Vec::with_capacity(deferred.len());
        for DeferredSend { ticket, request } in deferred {
            match self.scheduler.enqueue_reserved(ticket, request.clone()) {
                Ok(_) => flushed.push(request),
                Err(e) => {
                    warn!(origin = %request.origin, %ticket, error = %e, "Failed to queue deferred send");
                    self.scheduler.discard(ticket);
                }
            }
        }
        self.stats.lock().deferred_flushed += flushed.len() as u64;
        flushed
    }

    /// Whether the reply policy allows answering `message`
    pub fn may_reply(&self, message: &InboundMessage) -> bool {
        if message.arrived_via_relay && !self.response.respond_to_relayed {
            return false;
        }
        if message.is_direct {
            return self.response.respond_in_directs;
        }
        self.response.respond_in_channels
            && (message.channel_index != 0 || self.response.respond_on_primary_channel)
    }

    /// Dispatch inbound messages and mirror transmitted records until
    /// cancelled or the inbound stream ends
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut sent: broadcast::Receiver<OutboundRecord>,
        cancel: CancellationToken,
    ) {
        info!(alias = %self.parser.alias(), "Dispatcher started");
        let mut sweep = tokio::time::interval(SUPPRESSION_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut mirror_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                message = inbound.recv() => {
                    match message {
                        Some(message) => {
                            self.dispatch(message).await;
                        }
                        None => {
                            debug!("Inbound stream closed");
                            break;
                        }
                    }
                }

                record = sent.recv(), if mirror_open => {
                    match record {
                        Ok(record) => {
                            self.mirror_sent(&record).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Outbound mirror lagged; records skipped");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            mirror_open = false;
                        }
                    }
                }

                _ = sweep.tick() => {
                    let expired = self.suppression.expire();
                    if expired > 0 {
                        trace!(expired, "Suppression entries expired");
                    }
                }
            }
        }

        self.suppression.clear();
        info!("Dispatcher stopped");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("alias", &self.parser.alias())
            .field("plugins", &self.registry.len())
            .finish()
    }
}
