//! Every queued mutation ends `Synced` or `Failed`, whatever the backend does.

use proptest::prelude::*;
use std::time::Duration;
use tidepool_engine::{EngineConfig, QueueConfig, RetryConfig};
use tidepool_protocol::MutationStatus;
use tidepool_testkit::prelude::*;

const MAX_ATTEMPTS: u32 = 3;

fn drain(writes: Vec<QueuedWrite>, plan: Vec<BackendFault>) -> Vec<MutationStatus> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap();

    runtime.block_on(async move {
        let retry = RetryConfig::new(MAX_ATTEMPTS)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(8));
        let config = EngineConfig::default().with_queue(QueueConfig::default().with_retry(retry));
        let fx = TestEngine::memory_with(config);
        // Timers stay idle; rounds are driven below.
        fx.queue().set_online(false);

        let ids: Vec<String> = writes
            .into_iter()
            .map(|w| {
                fx.queue()
                    .enqueue(w.table, w.id, w.action, w.payload, w.priority)
                    .unwrap()
            })
            .collect();

        let settle_rounds = (MAX_ATTEMPTS as usize + 1).max(1);
        let rounds = plan
            .into_iter()
            .chain(std::iter::repeat(BackendFault::Healthy).take(settle_rounds));
        for fault in rounds {
            fx.backend.set_online(fault != BackendFault::Offline);
            if let BackendFault::FailPushes(n) = fault {
                fx.backend.fail_pushes(n);
            }
            fx.queue().process_pending(fx.sync().as_ref()).await.unwrap();
            fx.clock.advance(Duration::from_secs(60));
            if fx.queue().is_empty() {
                break;
            }
        }

        ids.iter()
            .map(|id| fx.queue().mutation(id).unwrap().status)
            .collect()
    })
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn every_mutation_reaches_a_terminal_status(
        writes in queued_writes_strategy(12),
        plan in fault_plan_strategy(6),
    ) {
        let statuses = drain(writes.clone(), plan);
        prop_assert_eq!(statuses.len(), writes.len());
        for status in statuses {
            prop_assert!(status.is_terminal(), "unresolved status {:?}", status);
        }
    }
}

#[test]
fn healthy_backend_syncs_everything() {
    let writes = vec![QueuedWrite {
        table: tidepool_protocol::Table::Tasks,
        id: "t-1".into(),
        action: tidepool_protocol::MutationAction::Create,
        payload: task("t-1", "u-1", "ship it"),
        priority: tidepool_protocol::Priority::Normal,
    }];
    let statuses = drain(writes, vec![BackendFault::Healthy]);
    assert_eq!(statuses, vec![MutationStatus::Synced]);
}
