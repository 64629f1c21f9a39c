//! Integration tests for the mesh bridge
//!
//! These run the whole bridge against a mock radio link:
//! - Loop prevention end to end
//! - Command recognition and deterministic routing
//! - Emergency fan-out
//! - Chunking and priority on the outbound path
//! - Plugin fault containment and auto-disable
//! - Link recovery
//! - Bounded unload of plugins with background pollers

use meshbridge_core::scheduler::split_text;
use meshbridge_core::test_utils::{
    text_frame, write_plugin_dir, MockLink, MockTransport, PollingPlugin, Recorder,
    RecordingPlugin,
};
use meshbridge_core::{
    BridgeConfigBuilder, BridgeHandle, LinkState, MeshBridge, NodeId, OutboundRequest,
    PluginCatalog, Priority, Result, TicketStatus,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Harness
// ============================================================================

const MARKER: &str = "m@i- ";

struct Harness {
    handle: BridgeHandle,
    link: MockLink,
    task: JoinHandle<Result<()>>,
    _root: TempDir,
}

impl Harness {
    async fn start(builder: BridgeConfigBuilder, catalog: PluginCatalog, enabled: &[&str]) -> Self {
        let root = tempfile::tempdir().unwrap();
        for id in enabled {
            write_plugin_dir(root.path(), id, json!({ "enabled": true })).unwrap();
        }
        let config = builder.alias_suffix("x7").plugin_root(root.path()).build();
        let (transport, link) = MockTransport::new("radio");
        let (bridge, handle) = MeshBridge::new(config, vec![Box::new(transport)], catalog).unwrap();
        let task = tokio::spawn(bridge.run());
        assert!(handle.link().wait_until_usable(Duration::from_secs(30)).await);
        Self {
            handle,
            link,
            task,
            _root: root,
        }
    }

    /// Broadcast `text` from `from` on channel 1
    fn say(&self, from: u32, text: &str) {
        self.link
            .inject(text_frame(NodeId(from), NodeId::BROADCAST, 1, text));
    }

    fn written(&self) -> Vec<String> {
        self.link
            .written_texts()
            .into_iter()
            .map(|(_, _, text)| text)
            .collect()
    }

    async fn stop(self) {
        self.handle.shutdown().await.unwrap();
        self.task.await.unwrap().unwrap();
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..1200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition never held: {what}");
}

/// Let the bridge drain whatever is in flight
async fn settle() {
    tokio::time::sleep(Duration::from_secs(60)).await;
}

fn recording(id: &'static str, recorder: Recorder) -> impl Fn() -> RecordingPlugin + Send + Sync + 'static {
    move || RecordingPlugin::new(id).with_recorder(recorder.clone())
}

// ============================================================================
// Loop prevention
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_machine_marker_never_answered_but_observed() {
    let recorder = Recorder::default();
    let catalog = PluginCatalog::new().with("observer", recording("observer", recorder.clone()));
    let bridge = Harness::start(BridgeConfigBuilder::new(), catalog, &["observer"]).await;

    bridge.say(7, "m@i- /ping");
    eventually("observer saw marked text", || recorder.messages().len() == 1).await;
    assert!(recorder.messages()[0].1, "flagged machine-origin");

    // the same node is now remembered as a machine
    bridge.say(7, "/ping");
    eventually("observer saw follow-up", || recorder.messages().len() == 2).await;
    settle().await;
    assert!(bridge.written().is_empty());

    // a human elsewhere still gets an answer
    bridge.say(8, "/ping");
    eventually("reply written", || !bridge.written().is_empty()).await;
    assert_eq!(bridge.written(), vec![format!("{MARKER}pong")]);
    assert!(recorder.commands().is_empty());

    bridge.stop().await;
}

// ============================================================================
// Command recognition and routing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unsuffixed_commands_never_reach_handlers() {
    let recorder = Recorder::default();
    let catalog = PluginCatalog::new().with("weather", {
        let recorder = recorder.clone();
        move || {
            RecordingPlugin::new("weather")
                .with_reply("weather", "sunny")
                .with_recorder(recorder.clone())
        }
    });
    let bridge = Harness::start(BridgeConfigBuilder::new(), catalog, &["weather"]).await;

    bridge.say(9, "/weather");
    bridge.say(9, "/weather-zz");
    eventually("both observed", || recorder.messages().len() == 2).await;
    settle().await;
    assert!(recorder.commands().is_empty());
    assert!(bridge.written().is_empty());

    bridge.say(9, "/weather-x7");
    eventually("reply written", || !bridge.written().is_empty()).await;
    assert_eq!(bridge.written(), vec![format!("{MARKER}sunny")]);
    assert_eq!(recorder.commands(), vec!["weather".to_string()]);

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_first_responder_is_deterministic() {
    let mut responders = Vec::new();
    for _ in 0..3 {
        let catalog = PluginCatalog::new()
            .with("alpha", || RecordingPlugin::new("alpha").with_catch_all("alpha answers"))
            .with("beta", || RecordingPlugin::new("beta").with_catch_all("beta answers"));
        let bridge = Harness::start(BridgeConfigBuilder::new(), catalog, &["beta", "alpha"]).await;
        bridge.say(11, "/mystery-x7");
        eventually("reply written", || !bridge.written().is_empty()).await;
        responders.push(bridge.written()[0].clone());
        bridge.stop().await;
    }
    // discovery is sorted, so alpha registers first every time
    assert!(responders.iter().all(|r| r == &format!("{MARKER}alpha answers")));
}

// ============================================================================
// Emergencies
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_emergency_reaches_every_hook_exactly_once() {
    const N: usize = 5;
    let ids = ["e0", "e1", "e2", "e3", "e4"];
    let recorders: Vec<Recorder> = (0..N).map(|_| Recorder::default()).collect();
    let mut catalog = PluginCatalog::new();
    for (id, recorder) in ids.iter().zip(&recorders) {
        catalog.register(*id, recording(*id, recorder.clone()));
    }
    let bridge = Harness::start(BridgeConfigBuilder::new(), catalog, &ids).await;

    bridge.say(12, "/911 trapped at the trailhead");
    eventually("all alerted", || recorders.iter().all(|r| !r.emergencies().is_empty())).await;
    eventually("ack written", || !bridge.written().is_empty()).await;
    settle().await;

    for recorder in &recorders {
        let alerts = recorder.emergencies();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].starts_with("EMERGENCY from"));
        assert!(alerts[0].contains("trapped at the trailhead"));
    }
    assert_eq!(
        bridge.written(),
        vec![format!("{MARKER}Emergency alert sent. Stay safe.")]
    );

    bridge.stop().await;
}

// ============================================================================
// Outbound path
// ============================================================================

#[test]
fn test_split_chunk_count_and_order() {
    for (len, size) in [(1usize, 10usize), (10, 10), (11, 10), (95, 10), (400, 200), (401, 200)] {
        let text: String = (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let split = split_text(&text, size, usize::MAX);
        assert_eq!(split.chunks.len(), len.div_ceil(size), "len {len} size {size}");
        assert_eq!(split.chunks.concat(), text);
        assert!(!split.truncated);
    }

    let split = split_text(&"w".repeat(100), 10, 4);
    assert_eq!(split.chunks.len(), 4);
    assert!(split.truncated);
}

#[tokio::test(start_paused = true)]
async fn test_long_reply_is_chunked_in_order() {
    let story = "Once upon a time on a ridge far away. ".repeat(12);
    let builder = BridgeConfigBuilder::new()
        .frame_size(100)
        .max_chunks(10)
        .chunk_delay(Duration::from_secs(3))
        .custom_command("story", story.clone(), "Tell a story");
    let bridge = Harness::start(builder, PluginCatalog::new(), &[]).await;

    bridge.say(13, "/story-x7");
    let expected = format!("{MARKER}{story}");
    let chunks = expected.len().div_ceil(100);
    eventually("all chunks written", || bridge.written().len() == chunks).await;
    assert_eq!(bridge.written().concat(), expected);

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_emergency_overtakes_queued_normals() {
    let builder = BridgeConfigBuilder::new().chunk_delay(Duration::from_secs(5));
    let bridge = Harness::start(builder, PluginCatalog::new(), &[]).await;

    let normals: Vec<_> = (0..10)
        .map(|i| {
            bridge
                .handle
                .send(OutboundRequest::broadcast(format!("normal {i}"), 2))
                .unwrap()
                .ticket
        })
        .collect();
    let started: Vec<bool> = normals
        .iter()
        .map(|t| bridge.handle.ticket_status(t) != Some(TicketStatus::Queued))
        .collect();
    let sos = bridge
        .handle
        .send(OutboundRequest::broadcast("SOS", 2).with_priority(Priority::Emergency))
        .unwrap();
    assert!(!sos.was_dropped());

    eventually("everything sent", || bridge.written().len() == 11).await;
    let written = bridge.written();
    let sos_at = written.iter().position(|t| t == "SOS").unwrap();
    for (i, was_started) in started.iter().enumerate() {
        let at = written.iter().position(|t| t == &format!("normal {i}")).unwrap();
        if !was_started {
            assert!(sos_at < at, "SOS after unstarted normal {i}: {written:?}");
        }
    }
    // normals keep FIFO order among themselves
    let order: Vec<&String> = written.iter().filter(|t| t.starts_with("normal")).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("normal {i}")).collect();
    assert_eq!(order, expected.iter().collect::<Vec<_>>());

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_from_hook_is_trackable_until_sent() {
    let recorder = Recorder::default();
    let catalog = PluginCatalog::new().with("chatty", {
        let recorder = recorder.clone();
        move || {
            RecordingPlugin::new("chatty")
                .sending_on_message("noted")
                .with_recorder(recorder.clone())
        }
    });
    let bridge = Harness::start(BridgeConfigBuilder::new(), catalog, &["chatty"]).await;

    bridge.say(7, "anyone there");
    eventually("hook send written", || bridge.written() == vec!["noted".to_string()]).await;
    let ticket = recorder.tickets()[0];
    eventually("ticket reports sent", || {
        matches!(bridge.handle.ticket_status(&ticket), Some(TicketStatus::Sent { chunks: 1, .. }))
    })
    .await;

    bridge.stop().await;
}

// ============================================================================
// Plugin faults
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_failing_plugin_disabled_others_unaffected() {
    let healthy = Recorder::default();
    let catalog = PluginCatalog::new()
        .with("broken", || RecordingPlugin::new("broken").failing())
        .with("healthy", recording("healthy", healthy.clone()));
    let builder = BridgeConfigBuilder::new().failure_threshold(3);
    let bridge = Harness::start(builder, catalog, &["broken", "healthy"]).await;

    for i in 0..6 {
        bridge.say(20 + i, &format!("hello {i}"));
    }
    eventually("healthy saw all", || healthy.messages().len() == 6).await;

    let status = bridge.handle.status().await.unwrap();
    let broken = status.plugins.iter().find(|p| p.id == "broken").unwrap();
    assert!(broken.faulted);
    assert!(broken.loaded);
    assert_eq!(status.dispatch.hook_failures, 3);

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_hook_bounded_by_budget() {
    let after = Recorder::default();
    let catalog = PluginCatalog::new()
        .with("aaslow", || RecordingPlugin::new("aaslow").slow(Duration::from_secs(3600)))
        .with("after", recording("after", after.clone()));
    let builder = BridgeConfigBuilder::new().hook_timeout(Duration::from_secs(2));
    let bridge = Harness::start(builder, catalog, &["aaslow", "after"]).await;

    let started = Instant::now();
    bridge.say(30, "anyone there");
    eventually("second plugin reached", || after.messages().len() == 1).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    bridge.stop().await;
}

// ============================================================================
// Link recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_link_recovers_within_backoff_bound() {
    let builder = BridgeConfigBuilder::new()
        .reconnect_backoff(Duration::from_secs(1), Duration::from_secs(4));
    let bridge = Harness::start(builder, PluginCatalog::new(), &[]).await;
    let mut states = bridge.handle.link().subscribe();

    bridge.link.set_healthy(false);
    states
        .wait_for(|s| *s == LinkState::Reconnecting)
        .await
        .unwrap();
    // several failed rounds push the backoff to its cap
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(bridge.handle.link().current_state(), LinkState::Reconnecting);

    bridge.link.set_healthy(true);
    let healed = Instant::now();
    assert!(bridge.handle.link().wait_until_usable(Duration::from_secs(30)).await);
    assert!(healed.elapsed() <= Duration::from_secs(4));

    // traffic flows again
    bridge.say(40, "/ping");
    eventually("reply after recovery", || !bridge.written().is_empty()).await;

    bridge.stop().await;
}

// ============================================================================
// Unload
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unload_stops_sleeping_poller_promptly() {
    let sends = Arc::new(AtomicUsize::new(0));
    let catalog = PluginCatalog::new().with("poller", {
        let sends = sends.clone();
        move || PollingPlugin::new(Duration::from_secs(30)).with_counter(sends.clone())
    });
    let builder = BridgeConfigBuilder::new()
        .chunk_delay(Duration::from_secs(1))
        .unload_timeout(Duration::from_secs(5));
    let bridge = Harness::start(builder, catalog, &["poller"]).await;

    tokio::time::sleep(Duration::from_secs(65)).await;
    assert_eq!(sends.load(Ordering::SeqCst), 2);

    // poller is 5s into a 30s sleep
    let started = Instant::now();
    let registration = bridge.handle.toggle("poller", false).await.unwrap();
    assert!(!registration.loaded);
    assert!(started.elapsed() < Duration::from_secs(5));

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(sends.load(Ordering::SeqCst), 2);
    assert_eq!(bridge.written(), vec!["tick".to_string(), "tick".to_string()]);

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reload_keeps_link_up() {
    let recorder = Recorder::default();
    let catalog = PluginCatalog::new().with("observer", recording("observer", recorder.clone()));
    let bridge = Harness::start(BridgeConfigBuilder::new(), catalog, &["observer"]).await;
    let reconnects = bridge.handle.link().stats().reconnects;

    let loaded = bridge.handle.reload().await.unwrap();
    assert!(loaded.iter().any(|p| p.id == "observer" && p.loaded));
    assert_eq!(recorder.unloads(), 1);
    assert_eq!(bridge.handle.link().current_state(), LinkState::Connected);
    assert_eq!(bridge.handle.link().stats().reconnects, reconnects);

    bridge.stop().await;
}
