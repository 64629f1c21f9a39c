//! Hook isolation and plugin health
//!
//! Every call into plugin code goes through [`guarded_call`]: it is bounded
//! by a time budget and panics are caught, so a misbehaving plugin costs at
//! most one hook budget per message. Consecutive failures are counted per
//! plugin and trip a breaker that disables the plugin for the rest of its
//! load.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::error::BridgeError;

/// Which hook is being called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    /// `on_load`
    OnLoad,
    /// `on_unload`
    OnUnload,
    /// `on_message`
    OnMessage,
    /// `on_command`
    OnCommand,
    /// `on_emergency`
    OnEmergency,
    /// `on_send`
    OnSend,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookKind::OnLoad => "onLoad",
            HookKind::OnUnload => "onUnload",
            HookKind::OnMessage => "onMessage",
            HookKind::OnCommand => "onCommand",
            HookKind::OnEmergency => "onEmergency",
            HookKind::OnSend => "onSend",
        };
        f.write_str(name)
    }
}

/// Per-plugin health statistics for the circuit breaker
#[derive(Debug, Default)]
pub struct HookStats {
    call_count: AtomicU64,
    failure_count: AtomicU64,
    consecutive_failures: AtomicU64,
    total_latency_us: AtomicU64,
    disabled: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Serializable view of [`HookStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Hook calls made
    pub calls: u64,
    /// Hook calls that failed
    pub failures: u64,
    /// Failures since the last success
    pub consecutive_failures: u64,
    /// Average hook latency in microseconds
    pub avg_latency_us: u64,
    /// Disabled by the breaker
    pub disabled: bool,
    /// Most recent failure
    pub last_error: Option<String>,
}

impl HookStats {
    /// Fresh statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a successful call
    pub fn record_success(&self, latency: Duration) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Count a failed call. Returns the consecutive failure count.
    pub fn record_failure(&self, latency: Duration, reason: &str) -> u64 {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        *self.last_error.lock() = Some(reason.to_string());
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether the breaker tripped
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Trip the breaker. Returns true if it was not already tripped.
    pub fn disable(&self) -> bool {
        !self.disabled.swap(true, Ordering::Relaxed)
    }

    /// Failures since the last success
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Average call latency
    pub fn avg_latency(&self) -> Duration {
        let calls = self.call_count.load(Ordering::Relaxed);
        if calls == 0 {
            return Duration::ZERO;
        }
        let total = self.total_latency_us.load(Ordering::Relaxed);
        Duration::from_micros(total / calls)
    }

    /// Snapshot for status output
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            calls: self.call_count.load(Ordering::Relaxed),
            failures: self.failure_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
            avg_latency_us: self.avg_latency().as_micros() as u64,
            disabled: self.is_disabled(),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Limits applied to every hook call
#[derive(Debug, Clone, Copy)]
pub struct HookLimits {
    /// Time budget per call
    pub timeout: Duration,
    /// Consecutive failures before the plugin is disabled
    pub failure_threshold: u32,
}

/// Run plugin code under a time budget with panics contained.
///
/// Failures are counted in `stats` and returned as
/// [`BridgeError::PluginFault`]. Reaching the failure threshold disables
/// the plugin.
pub async fn guarded_call<T, F>(
    plugin: &str,
    hook: HookKind,
    stats: &HookStats,
    limits: HookLimits,
    call: F,
) -> Result<T, BridgeError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let start = Instant::now();
    let outcome = tokio::time::timeout(limits.timeout, AssertUnwindSafe(call).catch_unwind()).await;

    let reason = match outcome {
        Ok(Ok(Ok(value))) => {
            stats.record_success(start.elapsed());
            return Ok(value);
        }
        Ok(Ok(Err(e))) => format!("{:#}", e),
        Ok(Err(panic)) => format!("panicked: {}", panic_message(panic.as_ref())),
        Err(_) => format!("exceeded time budget of {:?}", limits.timeout),
    };

    let failures = stats.record_failure(start.elapsed(), &reason);
    warn!(plugin, %hook, error = %reason, failures, "Plugin hook failed");

    if failures >= u64::from(limits.failure_threshold.max(1)) && stats.disable() {
        error!(
            plugin,
            failures,
            "Plugin disabled after {} consecutive failures", failures
        );
    }

    Err(BridgeError::PluginFault {
        plugin: plugin.to_string(),
        hook: hook.to_string(),
        reason,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> HookLimits {
        HookLimits {
            timeout: Duration::from_secs(1),
            failure_threshold: 2,
        }
    }

    #[tokio::test]
    async fn test_success_resets_consecutive() {
        let stats = HookStats::new();
        let _ = guarded_call("p", HookKind::OnMessage, &stats, limits(), async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        })
        .await;
        assert_eq!(stats.consecutive_failures(), 1);

        let value = guarded_call("p", HookKind::OnMessage, &stats, limits(), async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
        let snap = stats.snapshot();
        assert_eq!(snap.calls, 2);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let stats = HookStats::new();
        let err = guarded_call("p", HookKind::OnCommand, &stats, limits(), async {
            if stats.consecutive_failures() == 0 {
                panic!("plugin bug");
            }
            Ok(())
        })
        .await
        .unwrap_err();
        match err {
            BridgeError::PluginFault { plugin, hook, reason } => {
                assert_eq!(plugin, "p");
                assert_eq!(hook, "onCommand");
                assert!(reason.contains("plugin bug"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_and_trips_breaker() {
        let stats = HookStats::new();
        for _ in 0..2 {
            let err = guarded_call("slow", HookKind::OnEmergency, &stats, limits(), async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await
            .unwrap_err();
            assert!(err.to_string().contains("time budget"));
        }
        assert!(stats.is_disabled());
        assert!(!stats.disable());
    }
}
