//! Property-based tests using proptest to verify scheduling and replay invariants

#![allow(clippy::unwrap_used)]

mod common;

use duroflow::{Registry, TestRun, TestWorkflowEnvironment, WorkflowContext, WorkflowError, WorkflowReplayer};
use proptest::prelude::*;
use std::time::Duration;

fn fan_in_registry() -> Registry {
    Registry::builder()
        .register_workflow_typed("fan_in", |ctx: WorkflowContext, durations: Vec<u64>| async move {
            let ch = ctx.new_channel::<usize>();
            for (i, secs) in durations.iter().copied().enumerate() {
                let tx = ch.clone();
                ctx.spawn(move |ctx| async move {
                    ctx.sleep(Duration::from_secs(secs)).await?;
                    tx.send(&ctx, i).await
                });
            }
            let mut order = Vec::with_capacity(durations.len());
            for _ in 0..durations.len() {
                if let Some(i) = ch.receive(&ctx).await? {
                    order.push(i);
                }
            }
            Ok::<_, WorkflowError>(order)
        })
        .build()
        .unwrap()
}

fn run_fan_in(durations: &[u64]) -> (TestWorkflowEnvironment, TestRun) {
    let env = TestWorkflowEnvironment::new(fan_in_registry());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let run = runtime.block_on(env.execute_workflow("fan_in", durations)).unwrap();
    (env, run)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    /// Threads finish in timer order; ties resolve in thread creation order.
    #[test]
    fn prop_fan_in_order_is_deterministic(durations in prop::collection::vec(0u64..5, 1..8)) {
        let (_env, run) = run_fan_in(&durations);
        let mut expected: Vec<usize> = (0..durations.len()).collect();
        expected.sort_by_key(|&i| (durations[i], i));
        prop_assert_eq!(run.result_as::<Vec<usize>>().unwrap(), expected);
    }

    /// Replaying a recorded history reproduces the recorded commands byte for byte.
    #[test]
    fn prop_replay_matches_recording(durations in prop::collection::vec(0u64..5, 1..8)) {
        let (env, run) = run_fan_in(&durations);
        WorkflowReplayer::new(env.registry().clone()).replay(&run.history).unwrap();

        let mut replay = common::replaying_instance(env.registry().clone());
        for (i, record) in run.history.decisions.iter().enumerate() {
            let outcome = replay.process_events(run.history.replay_batch(i)).unwrap();
            prop_assert_eq!(
                serde_json::to_vec(&outcome.commands).unwrap(),
                serde_json::to_vec(&record.commands).unwrap()
            );
        }
    }
}
