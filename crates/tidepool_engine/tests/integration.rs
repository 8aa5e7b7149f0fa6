//! Integration tests for the assembled engine against the reference backend.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tidepool_engine::realtime::{ChannelCallbacks, ChannelState, SendOutcome};
use tidepool_engine::{Component, ComponentHealth, RowStatus, SyncOptions, SyncState};
use tidepool_protocol::{
    BroadcastEnvelope, ChannelEvent, ChannelFilter, MutationAction, MutationStatus, Priority,
    RowChange, RowChangeKind, Table,
};
use tidepool_testkit::prelude::*;

fn broadcast(n: usize) -> BroadcastEnvelope {
    BroadcastEnvelope::new("typing", json!({ "n": n }), FIXTURE_TIME)
}

#[tokio::test(start_paused = true)]
async fn offline_message_syncs_after_reconnect() {
    let fx = TestEngine::memory();
    fx.set_online(false).await;

    let id = fx.queue().enqueue_message("conv-1", "hello", "user-1").unwrap();
    assert_eq!(fx.queue().len(), 1);
    assert_eq!(fx.queue().mutation(&id).unwrap().status, MutationStatus::Pending);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fx.backend.push_calls(), 0);

    fx.set_online(true).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mutation = fx.queue().mutation(&id).unwrap();
    assert_eq!(mutation.status, MutationStatus::Synced);
    assert_eq!(fx.queue().len(), 0);
    let server = fx.backend.row(Table::Messages, &mutation.entity_id).unwrap();
    assert_eq!(server["content"], "hello");
}

#[tokio::test]
async fn remote_copy_replaces_unsynced_local_edit() {
    let fx = TestEngine::memory();
    let local = task("t-1", "u-1", "mine");
    fx.local.create(Table::Tasks, local.clone()).unwrap();
    let mutation_id = fx
        .queue()
        .enqueue(Table::Tasks, "t-1", MutationAction::Create, local, Priority::Normal)
        .unwrap();
    let remote = task("t-1", "u-1", "theirs");
    fx.backend.seed(Table::Tasks, remote.clone());

    assert!(fx.sync().sync("u-1", SyncOptions::forced()).await);

    let row = fx.local.get(Table::Tasks, "t-1").unwrap().unwrap();
    assert_eq!(row.data, remote);
    assert_eq!(row.status, RowStatus::Synced);
    assert_eq!(
        fx.queue().mutation(&mutation_id).unwrap().status,
        MutationStatus::Synced
    );
    assert_eq!(fx.queue().len(), 0);
    assert_eq!(fx.backend.row(Table::Tasks, "t-1"), Some(remote));
    assert_eq!(fx.sync().stats().conflicts_resolved, 1);
}

#[tokio::test]
async fn first_sync_takes_snapshot_then_pulls_incrementally() {
    let fx = TestEngine::memory();
    fx.backend.seed(Table::Profiles, profile("u-1", "Ada"));
    fx.backend.seed(Table::Tasks, task("t-1", "u-1", "one"));

    assert!(fx.sync().sync("u-1", SyncOptions::forced()).await);
    assert_eq!(fx.local.count(Table::Tasks).unwrap(), 1);
    assert_eq!(fx.sync().cursor(), fx.backend.cursor());

    fx.backend.seed(Table::Tasks, task("t-2", "u-1", "two"));
    fx.backend.delete(Table::Tasks, "t-1");
    assert!(fx.sync().sync("u-1", SyncOptions::forced()).await);

    assert!(fx.local.get(Table::Tasks, "t-1").unwrap().is_none());
    assert!(fx.local.get(Table::Tasks, "t-2").unwrap().is_some());
    assert_eq!(fx.sync().cursor(), fx.backend.cursor());
    assert_eq!(fx.sync().state(), SyncState::Synced);
}

#[tokio::test]
async fn second_sync_inside_min_interval_is_throttled() {
    with_test_engine(|fx| async move {
        assert!(fx.sync().sync("u-1", SyncOptions::default()).await);
        let calls = fx.backend.pull_calls() + fx.backend.push_calls();

        fx.clock.advance(Duration::from_secs(5));
        assert!(!fx.sync().sync("u-1", SyncOptions::default()).await);
        assert_eq!(fx.backend.pull_calls() + fx.backend.push_calls(), calls);
        assert_eq!(fx.sync().state(), SyncState::Throttled);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn overlapping_sync_returns_false_immediately() {
    let fx = TestEngine::memory();
    fx.backend.set_delay(Duration::from_secs(2));

    let sync = Arc::clone(fx.sync());
    let first = tokio::spawn(async move { sync.sync("u-1", SyncOptions::forced()).await });
    while !fx.sync().is_syncing() {
        tokio::task::yield_now().await;
    }

    let started = tokio::time::Instant::now();
    assert!(!fx.sync().sync("u-1", SyncOptions::forced()).await);
    assert_eq!(started.elapsed(), Duration::ZERO);

    assert!(first.await.unwrap());
    assert_eq!(fx.backend.pull_calls(), 1);
    assert_eq!(fx.sync().stats().contended, 1);
}

#[tokio::test]
async fn failed_syncs_raise_an_alert() {
    let fx = TestEngine::memory();
    fx.backend.set_online(false);
    for _ in 0..3 {
        assert!(!fx.sync().sync("u-1", SyncOptions::forced()).await);
    }
    let status = fx.sync().status().get();
    assert_eq!(status.consecutive_failures, 3);
    assert_eq!(status.message.as_deref(), Some("sync failed 3 times"));
    assert_eq!(
        fx.orchestrator().health().components[&Component::Sync].health,
        ComponentHealth::Error
    );

    fx.backend.set_online(true);
    assert!(fx.sync().sync("u-1", SyncOptions::forced()).await);
    assert!(!fx.sync().status().get().needs_attention());
}

#[tokio::test]
async fn queue_survives_restart_on_file_store() {
    let fx = TestEngine::file();
    fx.set_online(false).await;
    let id = fx
        .queue()
        .enqueue(
            Table::Tasks,
            "t-1",
            MutationAction::Create,
            task("t-1", "u-1", "draft"),
            Priority::High,
        )
        .unwrap();
    let path = fx.path().unwrap();

    let fx = fx.restart();
    assert!(path.exists());
    let restored = fx.queue().mutation(&id).unwrap();
    assert_eq!(restored.status, MutationStatus::Pending);
    assert_eq!(restored.priority, Priority::High);
}

#[tokio::test]
async fn row_change_invalidates_cached_domain() {
    let fx = TestEngine::memory();
    fx.cache()
        .cache("tasks", "list:u-1", json!([task("t-1", "u-1", "one")]), None);
    assert!(fx.cache().get("tasks", "list:u-1").is_some());

    fx.realtime()
        .subscribe(
            "tasks:u-1",
            ChannelFilter::table(Table::Tasks),
            ChannelCallbacks::new(),
        )
        .await
        .unwrap();
    let delivered = fx.realtime().dispatch(
        "tasks:u-1",
        ChannelEvent::RowChange(RowChange {
            table: Table::Tasks,
            kind: RowChangeKind::Update,
            record: Some(task("t-1", "u-1", "one, edited")),
            old_record: None,
            commit_timestamp: FIXTURE_TIME.into(),
        }),
    );

    assert!(delivered);
    assert!(fx.cache().get("tasks", "list:u-1").is_none());
}

#[tokio::test]
async fn cached_asset_urls_reach_the_prefetch_backlog() {
    let fx = TestEngine::memory();
    let mut row = profile("u-1", "Ada");
    row["avatar_url"] = json!("https://cdn.example.com/ada.png");

    let write = fx.cache().cache("profiles", "u-1", row, None);
    assert_eq!(write.assets_forwarded, 1);
    assert_eq!(
        fx.prefetch().asset_backlog(),
        vec!["https://cdn.example.com/ada.png".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn message_over_rate_limit_is_batched() {
    let fx = TestEngine::memory();
    fx.realtime()
        .subscribe("room", ChannelFilter::default(), ChannelCallbacks::new())
        .await
        .unwrap();

    for n in 0..10 {
        let outcome = fx.realtime().send("room", broadcast(n)).await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
    }
    let outcome = fx.realtime().send("room", broadcast(10)).await.unwrap();
    assert_eq!(outcome, SendOutcome::Batched);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fx.transport.messages_sent("room"), 11);
}

#[tokio::test(start_paused = true)]
async fn overloaded_topics_each_deliver_everything() {
    let fx = TestEngine::memory();
    for topic in ["a", "b"] {
        fx.realtime()
            .subscribe(topic, ChannelFilter::default(), ChannelCallbacks::new())
            .await
            .unwrap();
    }

    for n in 0..40 {
        let topic = if n % 2 == 0 { "a" } else { "b" };
        fx.realtime().send(topic, broadcast(n)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(fx.transport.messages_sent("a"), 20);
    assert_eq!(fx.transport.messages_sent("b"), 20);
    assert_eq!(fx.realtime().metrics().queued_messages, 0);
}

#[tokio::test]
async fn optimization_repairs_orphaned_rows() {
    let fx = TestEngine::memory();
    fx.set_online(false).await;
    fx.local
        .create(Table::Tasks, task("t-9", "u-1", "orphan"))
        .unwrap();

    let report = fx.orchestrator().perform_optimization();
    assert_eq!(report.consistency.orphaned_rows, vec!["tasks:t-9".to_string()]);
    assert_eq!(report.consistency.repaired, 1);
    assert!(fx.queue().has_active_mutation(Table::Tasks, "t-9"));

    let diagnostics = fx.orchestrator().get_diagnostics();
    assert_eq!(diagnostics.queue.pending, 1);
    assert_eq!(
        diagnostics.health.components[&Component::Queue].health,
        ComponentHealth::Offline
    );
    let payload = serde_json::to_value(&diagnostics).unwrap();
    assert_eq!(payload["health"]["components"]["queue"]["health"], "offline");
}

#[tokio::test]
async fn force_sync_all_reconnects_channels() {
    let fx = TestEngine::memory();
    fx.transport.set_available(false);
    fx.realtime()
        .subscribe("room", ChannelFilter::default(), ChannelCallbacks::new())
        .await
        .unwrap();
    assert_eq!(fx.realtime().channel_state("room"), Some(ChannelState::Backoff));

    fx.transport.set_available(true);
    let report = fx.orchestrator().force_sync_all("u-1").await;

    assert!(report.synced);
    assert_eq!(report.channels_reconnected, 1);
    assert_eq!(fx.realtime().channel_state("room"), Some(ChannelState::Open));
}
