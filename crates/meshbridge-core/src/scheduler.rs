//! Outbound scheduler - chunking and pacing
//!
//! Every message leaving the bridge goes through here. Requests are split
//! into frame-sized chunks at enqueue time and transmitted one chunk at a
//! time with a fixed gap between transmissions, so the radio duty cycle is
//! respected no matter how many plugins are talking.
//!
//! Ordering:
//! - FIFO within a priority class
//! - emergency requests go before any normal request that has not started
//! - a request that has started is never interrupted
//!
//! The queue is bounded. When full, the oldest queued normal request is
//! dropped; emergency requests are never dropped and may exceed the bound.

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::connection::ConnectionHandle;
use crate::error::{BridgeError, Result};
use crate::message::{OutboundRequest, Priority};

/// Ticket statuses remembered after completion
const STATUS_RETENTION: usize = 1024;

/// Attempts per chunk before the request is failed
const MAX_CHUNK_ATTEMPTS: u32 = 3;

/// Handle for querying an enqueued request
pub type Ticket = Uuid;

/// Text split into transmission-sized pieces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedText {
    /// Ordered chunks
    pub chunks: Vec<String>,
    /// Whether text beyond the chunk limit was discarded
    pub truncated: bool,
}

/// Split `text` into chunks of at most `frame_size` bytes.
///
/// Splits never fall inside a multi-byte character; a character wider than
/// `frame_size` becomes its own chunk. At most `max_chunks` chunks are
/// returned and `truncated` reports whether anything was cut.
pub fn split_text(text: &str, frame_size: usize, max_chunks: usize) -> ChunkedText {
    let frame_size = frame_size.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        if chunks.len() == max_chunks {
            return ChunkedText {
                chunks,
                truncated: true,
            };
        }

        let mut end = rest.len().min(frame_size);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }

        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk.to_string());
        rest = tail;
    }

    ChunkedText {
        chunks,
        truncated: false,
    }
}

/// Lifecycle of an enqueued request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TicketStatus {
    /// Waiting in the queue
    Queued,
    /// Chunks are going out
    Transmitting {
        /// Chunks sent so far
        sent: usize,
        /// Total chunks
        total: usize,
    },
    /// Fully transmitted
    Sent {
        /// Chunks sent
        chunks: usize,
        /// Whether the text was truncated
        truncated: bool,
    },
    /// Evicted from a full queue before transmission
    Dropped,
    /// Transmission gave up
    Failed {
        /// Last error
        reason: String,
    },
}

/// Returned by [`OutboundScheduler::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    /// Ticket for status queries
    pub ticket: Ticket,
    /// Number of chunks that will be sent
    pub chunk_count: usize,
    /// Whether the text was truncated to the chunk limit
    pub truncated: bool,
    /// Request dropped to make room, possibly this one
    pub evicted: Option<Ticket>,
}

impl EnqueueReceipt {
    /// Whether this request itself was dropped at enqueue
    pub fn was_dropped(&self) -> bool {
        self.evicted == Some(self.ticket)
    }
}

/// Record of a fully transmitted request
#[derive(Debug, Clone, Serialize)]
pub struct OutboundRecord {
    /// Ticket of the request
    pub ticket: Ticket,
    /// The request as enqueued
    pub request: OutboundRequest,
    /// Chunks transmitted
    pub chunks: usize,
    /// Whether the text was truncated
    pub truncated: bool,
    /// Completion time
    pub sent_at: DateTime<Utc>,
}

/// Scheduler counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    /// Requests accepted
    pub enqueued: u64,
    /// Requests fully sent
    pub sent_requests: u64,
    /// Chunks sent
    pub sent_chunks: u64,
    /// Requests dropped from a full queue
    pub dropped: u64,
    /// Requests that failed to transmit
    pub failed: u64,
    /// Requests truncated to the chunk limit
    pub truncated: u64,
}

#[derive(Debug)]
struct Pending {
    ticket: Ticket,
    request: OutboundRequest,
    chunks: Vec<String>,
    truncated: bool,
}

#[derive(Debug, Default)]
struct Queues {
    emergency: VecDeque<Pending>,
    normal: VecDeque<Pending>,
}

impl Queues {
    fn len(&self) -> usize {
        self.emergency.len() + self.normal.len()
    }

    fn pop(&mut self) -> Option<Pending> {
        self.emergency.pop_front().or_else(|| self.normal.pop_front())
    }
}

struct Shared {
    queues: Mutex<Queues>,
    notify: Notify,
    statuses: Mutex<LruCache<Ticket, TicketStatus>>,
    stats: Mutex<SchedulerStats>,
    sent_tx: broadcast::Sender<OutboundRecord>,
}

/// Outbound scheduler
///
/// Cloning is cheap; clones share the queue.
#[derive(Clone)]
pub struct OutboundScheduler {
    shared: Arc<Shared>,
    config: SchedulerConfig,
}

impl OutboundScheduler {
    /// Create a scheduler
    pub fn new(config: SchedulerConfig) -> Self {
        let (sent_tx, _) = broadcast::channel(64);
        let retention = NonZeroUsize::new(STATUS_RETENTION).unwrap_or(NonZeroUsize::MIN);
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(Queues::default()),
                notify: Notify::new(),
                statuses: Mutex::new(LruCache::new(retention)),
                stats: Mutex::new(SchedulerStats::default()),
                sent_tx,
            }),
            config,
        }
    }

    /// Queue a request for transmission.
    ///
    /// Fails only for empty text. A full queue is resolved by eviction and
    /// reported through [`EnqueueReceipt::evicted`].
    pub fn enqueue(&self, request: OutboundRequest) -> Result<EnqueueReceipt> {
        self.enqueue_reserved(Uuid::new_v4(), request)
    }

    /// Issue a ticket for a request that will be enqueued later.
    ///
    /// The ticket reads [`TicketStatus::Queued`] until it is passed to
    /// [`enqueue_reserved`](Self::enqueue_reserved) or [`discard`](Self::discard).
    pub(crate) fn reserve(&self) -> Ticket {
        let ticket = Uuid::new_v4();
        self.set_status(ticket, TicketStatus::Queued);
        debug!(%ticket, "Ticket reserved for deferred send");
        ticket
    }

    /// Queue a request under a ticket issued by [`reserve`](Self::reserve)
    pub(crate) fn enqueue_reserved(&self, ticket: Ticket, request: OutboundRequest) -> Result<EnqueueReceipt> {
        if request.text.is_empty() {
            return Err(BridgeError::EmptyMessage);
        }

        let ChunkedText { chunks, truncated } =
            split_text(&request.text, self.config.frame_size, self.config.max_chunks);
        let chunk_count = chunks.len();
        if truncated {
            warn!(
                origin = %request.origin,
                chunks = chunk_count,
                length = request.text.len(),
                "Outbound text truncated to chunk limit"
            );
        }

        let pending = Pending {
            ticket,
            request,
            chunks,
            truncated,
        };

        let evicted = {
            let mut queues = self.shared.queues.lock();
            let full = queues.len() >= self.config.queue_depth;
            let emergency = pending.request.priority == Priority::Emergency;

            let evicted = if !full {
                None
            } else if let Some(oldest) = queues.normal.pop_front() {
                Some(oldest.ticket)
            } else if emergency {
                None
            } else {
                Some(ticket)
            };

            if evicted != Some(ticket) {
                if emergency {
                    queues.emergency.push_back(pending);
                } else {
                    queues.normal.push_back(pending);
                }
            }
            evicted
        };

        {
            let mut statuses = self.shared.statuses.lock();
            let mut stats = self.shared.stats.lock();
            stats.enqueued += 1;
            if truncated {
                stats.truncated += 1;
            }
            if evicted != Some(ticket) {
                statuses.put(ticket, TicketStatus::Queued);
            }
            if let Some(dropped) = evicted {
                statuses.put(dropped, TicketStatus::Dropped);
                stats.dropped += 1;
                warn!(ticket = %dropped, depth = self.config.queue_depth, "Outbound queue full, dropped oldest normal request");
            }
        }

        if evicted != Some(ticket) {
            self.shared.notify.notify_one();
        }
        debug!(%ticket, chunks = chunk_count, "Enqueued outbound request");

        Ok(EnqueueReceipt {
            ticket,
            chunk_count,
            truncated,
            evicted,
        })
    }

    /// Status of a ticket, if still retained
    pub fn status(&self, ticket: &Ticket) -> Option<TicketStatus> {
        self.shared.statuses.lock().peek(ticket).cloned()
    }

    /// Number of queued requests (not counting one in transmission)
    pub fn queued(&self) -> usize {
        self.shared.queues.lock().len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.lock().clone()
    }

    /// Subscribe to fully transmitted requests
    pub fn subscribe_sent(&self) -> broadcast::Receiver<OutboundRecord> {
        self.shared.sent_tx.subscribe()
    }

    /// Mark a reserved ticket as never transmitted
    pub(crate) fn discard(&self, ticket: Ticket) {
        self.set_status(ticket, TicketStatus::Dropped);
    }

    fn set_status(&self, ticket: Ticket, status: TicketStatus) {
        self.shared.statuses.lock().put(ticket, status);
    }

    /// Pacing loop. Runs until `cancel` fires.
    pub async fn run(self, link: ConnectionHandle, cancel: CancellationToken) {
        info!(
            frame_size = self.config.frame_size,
            chunk_delay = ?self.config.chunk_delay,
            "Starting outbound scheduler"
        );
        let mut state_rx = link.subscribe();
        let mut last_sent: Option<Instant> = None;

        loop {
            // Wait for work
            if self.queued() == 0 {
                tokio::select! {
                    _ = self.shared.notify.notified() => continue,
                    _ = cancel.cancelled() => break,
                }
            }

            // Pop only once the link is up so late emergencies still preempt
            tokio::select! {
                usable = async { state_rx.wait_for(|s| s.is_usable()).await.is_ok() } => if !usable { break },
                _ = cancel.cancelled() => break,
            }
            let Some(pending) = self.shared.queues.lock().pop() else {
                continue;
            };

            if !self.transmit(&link, pending, &mut last_sent, &cancel).await {
                break;
            }
        }

        info!("Outbound scheduler stopped");
    }

    /// Send all chunks of one request. Returns false on cancellation.
    async fn transmit(
        &self,
        link: &ConnectionHandle,
        pending: Pending,
        last_sent: &mut Option<Instant>,
        cancel: &CancellationToken,
    ) -> bool {
        let Pending {
            ticket,
            request,
            chunks,
            truncated,
        } = pending;
        let total = chunks.len();
        debug!(%ticket, origin = %request.origin, priority = ?request.priority, total, "Transmitting request");

        for (index, chunk) in chunks.iter().enumerate() {
            self.set_status(ticket, TicketStatus::Transmitting { sent: index, total });

            let mut attempts = 0;
            loop {
                if let Some(last) = *last_sent {
                    tokio::select! {
                        _ = tokio::time::sleep_until(last + self.config.chunk_delay) => {}
                        _ = cancel.cancelled() => {
                            self.fail(ticket, "scheduler stopped");
                            return false;
                        }
                    }
                }

                attempts += 1;
                match link.send_text(request.target, chunk).await {
                    Ok(()) => {
                        *last_sent = Some(Instant::now());
                        self.shared.stats.lock().sent_chunks += 1;
                        debug!(%ticket, chunk = index + 1, total, bytes = chunk.len(), "Chunk sent");
                        break;
                    }
                    Err(e) if attempts < MAX_CHUNK_ATTEMPTS => {
                        warn!(%ticket, chunk = index + 1, attempt = attempts, error = %e, "Chunk send failed, waiting for link");
                        if !self.wait_for_link(link, cancel).await {
                            self.fail(ticket, "scheduler stopped");
                            return false;
                        }
                    }
                    Err(e) => {
                        self.fail(ticket, &e.to_string());
                        return true;
                    }
                }
            }
        }

        self.set_status(ticket, TicketStatus::Sent { chunks: total, truncated });
        self.shared.stats.lock().sent_requests += 1;
        let record = OutboundRecord {
            ticket,
            request,
            chunks: total,
            truncated,
            sent_at: Utc::now(),
        };
        // No subscribers is fine
        let _ = self.shared.sent_tx.send(record);
        true
    }

    async fn wait_for_link(&self, link: &ConnectionHandle, cancel: &CancellationToken) -> bool {
        let mut rx = link.subscribe();
        tokio::select! {
            usable = async { rx.wait_for(|s| s.is_usable()).await.is_ok() } => usable,
            _ = cancel.cancelled() => false,
        }
    }

    fn fail(&self, ticket: Ticket, reason: &str) {
        warn!(%ticket, reason, "Outbound request failed");
        self.set_status(
            ticket,
            TicketStatus::Failed {
                reason: reason.to_string(),
            },
        );
        self.shared.stats.lock().failed += 1;
    }
}

impl std::fmt::Debug for OutboundScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundScheduler")
            .field("queued", &self.queued())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, BridgeConfigBuilder};
    use crate::connection::{ConnectionManager, LinkState};
    use crate::message::{NodeId, Target};
    use crate::test_utils::{MockLink, MockTransport};

    fn scheduler_config(queue_depth: usize) -> SchedulerConfig {
        SchedulerConfig {
            frame_size: 10,
            chunk_delay: Duration::from_secs(2),
            max_chunks: 3,
            queue_depth,
        }
    }

    fn connected_link(config: &BridgeConfig) -> (ConnectionHandle, MockLink) {
        let (transport, mock) = MockTransport::new("radio");
        let (manager, handle, _rx) = ConnectionManager::new(config, vec![Box::new(transport)]);
        tokio::spawn(manager.run());
        (handle, mock)
    }

    #[test]
    fn test_split_ascii() {
        let split = split_text("abcdefghij-klmnopqrst-uv", 10, 5);
        assert_eq!(split.chunks, vec!["abcdefghij", "-klmnopqrs", "t-uv"]);
        assert!(!split.truncated);
        assert_eq!(split.chunks.concat(), "abcdefghij-klmnopqrst-uv");
    }

    #[test]
    fn test_split_chunk_count_is_ceiling() {
        let text = "x".repeat(95);
        let split = split_text(&text, 10, 20);
        assert_eq!(split.chunks.len(), 10);
        assert_eq!(split.chunks.concat(), text);
    }

    #[test]
    fn test_split_never_breaks_characters() {
        let text = "héllo wörld ☃☃☃ ok";
        let split = split_text(text, 4, 50);
        assert!(split.chunks.iter().all(|c| c.len() <= 4));
        assert_eq!(split.chunks.concat(), text);
    }

    #[test]
    fn test_split_wide_char_in_tiny_frame() {
        let split = split_text("☃a", 1, 10);
        assert_eq!(split.chunks, vec!["☃", "a"]);
    }

    #[test]
    fn test_split_truncates() {
        let split = split_text(&"y".repeat(100), 10, 3);
        assert_eq!(split.chunks.len(), 3);
        assert!(split.truncated);
        assert_eq!(split.chunks.concat(), "y".repeat(30));
    }

    #[test]
    fn test_split_exact_fit_not_truncated() {
        let split = split_text(&"z".repeat(30), 10, 3);
        assert_eq!(split.chunks.len(), 3);
        assert!(!split.truncated);
    }

    #[test]
    fn test_enqueue_rejects_empty() {
        let scheduler = OutboundScheduler::new(scheduler_config(4));
        let err = scheduler
            .enqueue(OutboundRequest::broadcast("", 0))
            .unwrap_err();
        assert!(matches!(err, BridgeError::EmptyMessage));
    }

    #[test]
    fn test_enqueue_reports_truncation() {
        let scheduler = OutboundScheduler::new(scheduler_config(4));
        let receipt = scheduler
            .enqueue(OutboundRequest::broadcast("q".repeat(50), 0))
            .unwrap();
        assert_eq!(receipt.chunk_count, 3);
        assert!(receipt.truncated);
        assert_eq!(scheduler.status(&receipt.ticket), Some(TicketStatus::Queued));
        assert_eq!(scheduler.stats().truncated, 1);
    }

    #[test]
    fn test_full_queue_drops_oldest_normal() {
        let scheduler = OutboundScheduler::new(scheduler_config(2));
        let first = scheduler.enqueue(OutboundRequest::broadcast("one", 0)).unwrap();
        scheduler.enqueue(OutboundRequest::broadcast("two", 0)).unwrap();
        let third = scheduler.enqueue(OutboundRequest::broadcast("three", 0)).unwrap();

        assert_eq!(third.evicted, Some(first.ticket));
        assert_eq!(scheduler.status(&first.ticket), Some(TicketStatus::Dropped));
        assert_eq!(scheduler.queued(), 2);
        assert_eq!(scheduler.stats().dropped, 1);
    }

    #[test]
    fn test_emergency_never_dropped() {
        let scheduler = OutboundScheduler::new(scheduler_config(1));
        let sos = |t: &str| OutboundRequest::broadcast(t, 0).with_priority(Priority::Emergency);
        let a = scheduler.enqueue(sos("a")).unwrap();
        let b = scheduler.enqueue(sos("b")).unwrap();
        assert!(a.evicted.is_none());
        assert!(b.evicted.is_none());
        assert_eq!(scheduler.queued(), 2);

        // A normal request arriving at a queue full of emergencies is the one dropped
        let n = scheduler.enqueue(OutboundRequest::broadcast("n", 0)).unwrap();
        assert!(n.was_dropped());
        assert_eq!(scheduler.status(&n.ticket), Some(TicketStatus::Dropped));
        assert_eq!(scheduler.queued(), 2);
    }

    #[test]
    fn test_reserved_ticket_carries_through_enqueue() {
        let scheduler = OutboundScheduler::new(scheduler_config(4));
        let kept = scheduler.reserve();
        let dropped = scheduler.reserve();
        assert_eq!(scheduler.status(&kept), Some(TicketStatus::Queued));
        assert_eq!(scheduler.queued(), 0);

        let receipt = scheduler
            .enqueue_reserved(kept, OutboundRequest::broadcast("later", 0))
            .unwrap();
        assert_eq!(receipt.ticket, kept);
        assert_eq!(scheduler.queued(), 1);

        scheduler.discard(dropped);
        assert_eq!(scheduler.status(&dropped), Some(TicketStatus::Dropped));
        assert_eq!(scheduler.stats().dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_paced_by_delay() {
        let config = BridgeConfigBuilder::new().alias_suffix("x7").build();
        let (link, mock) = connected_link(&config);
        let scheduler = OutboundScheduler::new(scheduler_config(8));
        let cancel = CancellationToken::new();
        tokio::spawn(scheduler.clone().run(link.clone(), cancel.clone()));

        link.connect().await.unwrap();
        assert!(link.wait_until_usable(Duration::from_secs(5)).await);

        let mut sent = scheduler.subscribe_sent();
        let start = Instant::now();
        let receipt = scheduler
            .enqueue(OutboundRequest::direct("0123456789abcdefghijKLM", NodeId(5)))
            .unwrap();
        let record = sent.recv().await.unwrap();

        assert_eq!(record.ticket, receipt.ticket);
        assert_eq!(record.chunks, 3);
        // two gaps between three chunks
        assert!(start.elapsed() >= Duration::from_secs(4));
        let texts: Vec<String> = mock.written_texts().into_iter().map(|(_, _, t)| t).collect();
        assert_eq!(texts, vec!["0123456789", "abcdefghij", "KLM"]);
        assert_eq!(
            scheduler.status(&receipt.ticket),
            Some(TicketStatus::Sent { chunks: 3, truncated: false })
        );
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffers_while_disconnected_then_emergency_first() {
        let config = BridgeConfigBuilder::new().alias_suffix("x7").build();
        let (link, mock) = connected_link(&config);
        let scheduler = OutboundScheduler::new(scheduler_config(32));
        let cancel = CancellationToken::new();
        tokio::spawn(scheduler.clone().run(link.clone(), cancel.clone()));

        for i in 0..5 {
            scheduler
                .enqueue(OutboundRequest::broadcast(format!("normal {}", i), 0))
                .unwrap();
        }
        scheduler
            .enqueue(OutboundRequest::broadcast("SOS", 0).with_priority(Priority::Emergency))
            .unwrap();
        assert_eq!(link.current_state(), LinkState::Disconnected);
        assert!(mock.written_texts().is_empty());

        let mut sent = scheduler.subscribe_sent();
        link.connect().await.unwrap();
        for _ in 0..6 {
            sent.recv().await.unwrap();
        }
        let texts: Vec<String> = mock.written_texts().into_iter().map(|(_, _, t)| t).collect();
        assert_eq!(texts[0], "SOS");
        assert_eq!(&texts[1..], &["normal 0", "normal 1", "normal 2", "normal 3", "normal 4"]);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_target_preserved() {
        let config = BridgeConfigBuilder::new().alias_suffix("x7").build();
        let (link, mock) = connected_link(&config);
        let scheduler = OutboundScheduler::new(scheduler_config(8));
        let cancel = CancellationToken::new();
        tokio::spawn(scheduler.clone().run(link.clone(), cancel.clone()));
        link.connect().await.unwrap();

        let mut sent = scheduler.subscribe_sent();
        scheduler
            .enqueue(OutboundRequest::broadcast("chan", 2))
            .unwrap();
        let record = sent.recv().await.unwrap();
        assert_eq!(record.request.target, Target::Broadcast { channel: 2 });
        assert_eq!(mock.written_texts(), vec![(NodeId::BROADCAST, 2, "chan".to_string())]);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_loop() {
        let config = BridgeConfigBuilder::new().alias_suffix("x7").build();
        let (link, _mock) = connected_link(&config);
        let scheduler = OutboundScheduler::new(scheduler_config(8));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.clone().run(link, cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
