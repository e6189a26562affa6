#![allow(clippy::unwrap_used)]

mod common;

use common::{Harness, at, payload, replaying_instance, started};
use duroflow::{
    ActivityContext, Command, DecisionError, EventKind, HistoryEvent, InstanceOptions, Registry, ReplayError,
    TestWorkflowEnvironment, WorkflowContext, WorkflowError, WorkflowInstance, WorkflowReplayer,
};
use std::sync::Arc;
use std::time::Duration;

fn order_registry(first_activity: &'static str) -> Registry {
    Registry::builder()
        .register_activity_typed("reserve", |_ctx: ActivityContext, item: String| async move {
            Ok::<_, WorkflowError>(format!("reserved:{item}"))
        })
        .register_activity_typed("charge", |_ctx: ActivityContext, item: String| async move {
            Ok::<_, WorkflowError>(format!("charged:{item}"))
        })
        .register_activity_typed("stamp", |_ctx: ActivityContext, _: ()| async move { Ok::<_, WorkflowError>(7u32) })
        .register_workflow_typed("order", move |ctx: WorkflowContext, item: String| async move {
            let ctx = ctx.with_activity_options(common::activity_options());
            let first: String = ctx.execute_activity(first_activity, &item).await?;
            ctx.sleep(Duration::from_secs(30)).await?;
            let token: u64 = ctx.side_effect(|| 99).await;
            let stamp: u32 = ctx.execute_local_activity("stamp", &()).await?;
            let second: String = ctx.execute_activity("charge", &item).await?;
            Ok::<_, WorkflowError>(format!("{first}/{second}/{token}/{stamp}"))
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn recorded_run_replays_cleanly() {
    let env = TestWorkflowEnvironment::new(order_registry("reserve"));
    let run = env.execute_workflow("order", "book").await.unwrap();
    assert_eq!(run.result_as::<String>().unwrap(), "reserved:book/charged:book/99/7");

    WorkflowReplayer::new(env.registry().clone()).replay(&run.history).unwrap();
}

#[tokio::test]
async fn changed_workflow_code_is_reported_at_the_first_diverging_decision() {
    let env = TestWorkflowEnvironment::new(order_registry("reserve"));
    let run = env.execute_workflow("order", "book").await.unwrap();

    let changed = Arc::new(order_registry("charge"));
    let err = WorkflowReplayer::new(changed).replay(&run.history).unwrap_err();
    let ReplayError::CommandMismatch {
        decision,
        expected,
        actual,
    } = err
    else {
        panic!("expected a command mismatch, got {err:?}");
    };
    assert_eq!(decision, 0);
    assert!(matches!(&expected[0], Command::ScheduleActivity { activity_type, .. } if activity_type == "reserve"));
    assert!(matches!(&actual[0], Command::ScheduleActivity { activity_type, .. } if activity_type == "charge"));
}

#[tokio::test]
async fn replay_emits_byte_identical_commands() {
    let env = TestWorkflowEnvironment::new(order_registry("reserve"));
    let run = env.execute_workflow("order", "book").await.unwrap();

    let mut replay = replaying_instance(env.registry().clone());
    for (i, record) in run.history.decisions.iter().enumerate() {
        let outcome = replay.process_events(run.history.replay_batch(i)).unwrap();
        assert_eq!(
            serde_json::to_vec(&outcome.commands).unwrap(),
            serde_json::to_vec(&record.commands).unwrap(),
            "decision {i}"
        );
    }
    assert!(replay.is_closed());
}

fn sleeper() -> Registry {
    Registry::builder()
        .register_workflow_typed("sleeper", |ctx: WorkflowContext, _: ()| async move {
            ctx.sleep(Duration::from_secs(1)).await?;
            Ok::<_, WorkflowError>(())
        })
        .build()
        .unwrap()
}

#[test]
fn completion_for_unknown_operation_is_nondeterministic() {
    let mut h = Harness::new(sleeper());
    h.start("sleeper", &());
    let err = h.try_deliver(vec![EventKind::TimerFired { timer_id: 9 }]).unwrap_err();
    assert_eq!(
        err,
        DecisionError::NonDeterministic {
            message: "TimerFired refers to unknown operation 9".into()
        }
    );
}

#[test]
fn completion_of_the_wrong_kind_is_nondeterministic() {
    let mut h = Harness::new(sleeper());
    h.start("sleeper", &());
    let err = h
        .try_deliver(vec![EventKind::ActivityCompleted {
            scheduled_id: 1,
            result: payload(&()),
        }])
        .unwrap_err();
    assert!(matches!(err, DecisionError::NonDeterministic { .. }), "{err:?}");
}

#[test]
fn already_applied_events_are_skipped() {
    let mut instance = WorkflowInstance::new(Arc::new(sleeper()), common::execution(), InstanceOptions::default());
    let first = instance
        .process_events(vec![HistoryEvent::new(1, at(0), started("sleeper", &()))])
        .unwrap();
    assert_eq!(first.commands.len(), 1);

    let duplicate = instance
        .process_events(vec![HistoryEvent::new(1, at(1), EventKind::TimerFired { timer_id: 1 })])
        .unwrap();
    assert!(duplicate.commands.is_empty());
    assert_eq!(instance.last_event_id(), 1);

    let fired = instance
        .process_events(vec![HistoryEvent::new(2, at(1), EventKind::TimerFired { timer_id: 1 })])
        .unwrap();
    assert_eq!(fired.commands, vec![Command::CompleteWorkflow { result: payload(&()) }]);
}

#[test]
fn history_must_begin_with_the_start_event() {
    let mut h = Harness::new(sleeper());
    let err = h.try_deliver(vec![EventKind::TimerFired { timer_id: 1 }]).unwrap_err();
    assert_eq!(
        err,
        DecisionError::MissingStartEvent {
            found: "TimerFired".into()
        }
    );
}

#[test]
fn unregistered_workflow_type_fails_the_decision() {
    let mut h = Harness::new(sleeper());
    let err = h.try_deliver(vec![started("nope", &())]).unwrap_err();
    assert_eq!(
        err,
        DecisionError::NotRegistered {
            workflow_type: "nope".into()
        }
    );
}
