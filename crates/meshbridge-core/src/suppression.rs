//! Seen-node suppression set for preventing bot loops
//!
//! When two bridges (or a bridge and an AI responder) share a mesh, a reply
//! from one can trigger a reply from the other:
//!
//! 1. Node A asks a question
//! 2. Bridge B answers with machine-generated text
//! 3. Bridge C sees B's answer and answers it
//! 4. Bridge B answers C... and so on
//!
//! Machine-generated text carries a marker prefix. Any node seen emitting
//! marked text is remembered here for a TTL, and everything it sends during
//! that window is treated as machine-origin as well.
//!
//! The set is bounded: entries expire after the TTL and the least recently
//! refreshed entry is evicted once capacity is reached.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::LoopPreventionConfig;
use crate::message::NodeId;

/// Suppression statistics for monitoring
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SuppressionStats {
    /// Messages checked
    pub total_checks: u64,
    /// Messages classified as machine-origin
    pub suppressed: u64,
    /// Nodes added or refreshed
    pub nodes_marked: u64,
    /// Entries dropped because their TTL passed
    pub ttl_expirations: u64,
    /// Entries evicted at capacity
    pub lru_evictions: u64,
}

impl SuppressionStats {
    /// Fraction of checked messages that were suppressed
    pub fn suppression_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.suppressed as f64 / self.total_checks as f64
        }
    }
}

/// Why a message was classified as machine-origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineOrigin {
    /// Text starts with the machine marker
    Marker,
    /// Sender emitted marked text recently
    SeenNode,
}

/// Bounded TTL set of nodes that recently emitted machine-generated text
#[derive(Debug, Clone)]
pub struct SeenNodeSuppressionSet {
    nodes: Arc<Mutex<LruCache<NodeId, Instant>>>,
    ttl: Duration,
    marker: String,
    stats: Arc<Mutex<SuppressionStats>>,
}

impl SeenNodeSuppressionSet {
    /// Create from loop-prevention configuration
    pub fn from_config(config: &LoopPreventionConfig) -> Self {
        Self::new(
            config.machine_marker.clone(),
            config.suppression_capacity,
            config.suppression_ttl,
        )
    }

    /// Create with explicit marker, capacity and TTL
    pub fn new(marker: impl Into<String>, capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            nodes: Arc::new(Mutex::new(LruCache::new(cap))),
            ttl,
            marker: marker.into(),
            stats: Arc::new(Mutex::new(SuppressionStats::default())),
        }
    }

    /// The machine-origin marker
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Whether `text` carries the machine marker
    pub fn has_marker(&self, text: &str) -> bool {
        !self.marker.is_empty() && text.starts_with(&self.marker)
    }

    /// Classify an inbound message.
    ///
    /// Marked text records (or refreshes) the sender. Returns `None` for
    /// human traffic.
    pub fn check(&self, sender: NodeId, text: &str) -> Option<MachineOrigin> {
        self.stats.lock().total_checks += 1;

        let origin = if self.has_marker(text) {
            self.mark(sender);
            Some(MachineOrigin::Marker)
        } else if self.contains(sender) {
            Some(MachineOrigin::SeenNode)
        } else {
            None
        };

        if let Some(origin) = origin {
            self.stats.lock().suppressed += 1;
            debug!(node = %sender, ?origin, "Machine-origin message");
        }
        origin
    }

    /// Record `node` as a machine-text emitter
    pub fn mark(&self, node: NodeId) {
        let mut nodes = self.nodes.lock();
        let was_full = nodes.len() >= nodes.cap().get() && !nodes.contains(&node);
        nodes.put(node, Instant::now());
        drop(nodes);

        let mut stats = self.stats.lock();
        stats.nodes_marked += 1;
        if was_full {
            stats.lru_evictions += 1;
        }
        trace!(node = %node, "Node marked as machine-origin");
    }

    /// Whether `node` is currently suppressed. Expired entries are removed.
    pub fn contains(&self, node: NodeId) -> bool {
        let mut nodes = self.nodes.lock();
        match nodes.peek(&node) {
            Some(seen) if seen.elapsed() <= self.ttl => true,
            Some(_) => {
                nodes.pop(&node);
                drop(nodes);
                self.stats.lock().ttl_expirations += 1;
                trace!(node = %node, "Suppression entry expired");
                false
            }
            None => false,
        }
    }

    /// Drop all expired entries. Returns how many were removed.
    pub fn expire(&self) -> usize {
        let mut nodes = self.nodes.lock();
        let expired: Vec<NodeId> = nodes
            .iter()
            .filter(|(_, seen)| seen.elapsed() > self.ttl)
            .map(|(node, _)| *node)
            .collect();
        for node in &expired {
            nodes.pop(node);
        }
        drop(nodes);

        if !expired.is_empty() {
            self.stats.lock().ttl_expirations += expired.len() as u64;
            debug!(count = expired.len(), "Expired suppression entries");
        }
        expired.len()
    }

    /// Number of tracked nodes
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Whether no node is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of tracked nodes
    pub fn capacity(&self) -> usize {
        self.nodes.lock().cap().get()
    }

    /// Configured TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Statistics snapshot
    pub fn stats(&self) -> SuppressionStats {
        self.stats.lock().clone()
    }

    /// Forget every node
    pub fn clear(&self) {
        self.nodes.lock().clear();
    }
}
