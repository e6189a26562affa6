#![allow(clippy::unwrap_used)]

mod common;

use common::{Harness, at, payload, replaying_instance, started};
use duroflow::{
    Command, DEFAULT_VERSION, DecisionError, DecisionRecord, EventKind, HistoryEvent, InstanceOptions,
    LocalActivityOptions, MarkerData, RecordedHistory, Registry, Version, WorkflowContext, WorkflowError,
    WorkflowInstance, WorkflowReplayer,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn side_effect_registry(value: u32, calls: Arc<AtomicU32>) -> Registry {
    Registry::builder()
        .register_workflow_typed("random", move |ctx: WorkflowContext, _: ()| {
            let calls = calls.clone();
            async move {
                let v: u32 = ctx
                    .side_effect(move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        value
                    })
                    .await;
                Ok::<_, WorkflowError>(v)
            }
        })
        .build()
        .unwrap()
}

#[test]
fn side_effect_records_once_and_replays_the_recorded_value() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut h = Harness::new(side_effect_registry(42, calls.clone()));
    let live = h.start("random", &());
    assert_eq!(
        live.commands,
        vec![
            Command::RecordMarker {
                marker: MarkerData::SideEffect {
                    id: 1,
                    value: payload(&42)
                }
            },
            Command::CompleteWorkflow { result: payload(&42) },
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Replay with code that would now produce 7: the recorded 42 wins.
    let replay_calls = Arc::new(AtomicU32::new(0));
    let mut replay = replaying_instance(Arc::new(side_effect_registry(7, replay_calls.clone())));
    let outcome = replay
        .process_events(vec![
            HistoryEvent::new(1, at(0), started("random", &())),
            HistoryEvent::new(
                2,
                at(0),
                EventKind::MarkerRecorded {
                    marker: MarkerData::SideEffect {
                        id: 1,
                        value: payload(&42),
                    },
                },
            ),
        ])
        .unwrap();
    assert_eq!(outcome.commands, live.commands);
    assert_eq!(replay_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn side_effect_without_marker_on_replay_is_nondeterministic() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut replay = replaying_instance(Arc::new(side_effect_registry(42, calls.clone())));
    let err = replay
        .process_events(vec![HistoryEvent::new(1, at(0), started("random", &()))])
        .unwrap_err();
    assert!(matches!(err, DecisionError::NonDeterministic { .. }), "{err:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

fn versioned_registry() -> Registry {
    Registry::builder()
        .register_workflow_typed("versioned", |ctx: WorkflowContext, _: ()| async move {
            let first = ctx.get_version("new-path", DEFAULT_VERSION, Version(2)).await;
            let again = ctx.get_version("new-path", DEFAULT_VERSION, Version(2)).await;
            Ok::<_, WorkflowError>((first.0, again.0))
        })
        .build()
        .unwrap()
}

#[test]
fn get_version_returns_max_on_live_runs_and_records_it_once() {
    let mut h = Harness::new(versioned_registry());
    let outcome = h.start("versioned", &());
    assert_eq!(
        outcome.commands,
        vec![
            Command::RecordMarker {
                marker: MarkerData::Version {
                    change_id: "new-path".into(),
                    version: Version(2)
                }
            },
            Command::CompleteWorkflow {
                result: payload(&(2, 2))
            },
        ]
    );
}

#[test]
fn get_version_on_old_history_returns_default_version() {
    let mut replay = replaying_instance(Arc::new(versioned_registry()));
    let outcome = replay
        .process_events(vec![HistoryEvent::new(1, at(0), started("versioned", &()))])
        .unwrap();
    assert_eq!(
        outcome.commands,
        vec![Command::CompleteWorkflow {
            result: payload(&(-1, -1))
        }]
    );
}

#[test]
fn recorded_version_outside_supported_range_fails_the_decision() {
    let mut replay = replaying_instance(Arc::new(versioned_registry()));
    let err = replay
        .process_events(vec![
            HistoryEvent::new(1, at(0), started("versioned", &())),
            HistoryEvent::new(
                2,
                at(0),
                EventKind::MarkerRecorded {
                    marker: MarkerData::Version {
                        change_id: "new-path".into(),
                        version: Version(5),
                    },
                },
            ),
        ])
        .unwrap_err();
    assert_eq!(
        err,
        DecisionError::VersionIncompatible {
            change_id: "new-path".into(),
            recorded: 5,
            min_supported: -1,
            max_supported: 2,
        }
    );
}

#[test]
fn local_activity_result_becomes_a_marker_that_replays() {
    let registry = Registry::builder()
        .register_workflow_typed("local", |ctx: WorkflowContext, n: u32| async move {
            let doubled: u32 = ctx.execute_local_activity("double", &n).await?;
            Ok::<_, WorkflowError>(doubled)
        })
        .build()
        .unwrap();
    let mut h = Harness::new(registry);

    let first = h.start("local", &21);
    assert_eq!(
        first.commands,
        vec![Command::ScheduleLocalActivity {
            id: 1,
            activity_type: "double".into(),
            input: payload(&21),
            options: LocalActivityOptions::default(),
        }]
    );
    let second = h.deliver(vec![EventKind::LocalActivityResult {
        id: 1,
        outcome: Ok(payload(&42)),
    }]);
    assert_eq!(
        second.commands,
        vec![
            Command::RecordMarker {
                marker: MarkerData::LocalActivity {
                    id: 1,
                    activity_type: "double".into(),
                    outcome: Ok(payload(&42)),
                }
            },
            Command::CompleteWorkflow { result: payload(&42) },
        ]
    );

    // The transient result is dropped from history; its marker replaces it.
    let mut history = RecordedHistory::new(common::execution());
    history.decisions.push(DecisionRecord {
        events: h.batches[0].clone(),
        markers: Vec::new(),
        commands: first.commands,
    });
    history.decisions.push(DecisionRecord {
        events: h.batches[1].clone(),
        markers: DecisionRecord::marker_events(&second.commands, 3, at(2)),
        commands: second.commands,
    });
    assert_eq!(history.events().len(), 2);
    WorkflowReplayer::new(h.registry()).replay(&history).unwrap();
}

fn side_effect_marker(id: u64, value: u32) -> Command {
    Command::RecordMarker {
        marker: MarkerData::SideEffect {
            id,
            value: payload(&value),
        },
    }
}

/// Three threads draw tokens; `base` shifts what every closure would return.
fn token_registry(base: u32, calls: Arc<AtomicU32>) -> Registry {
    Registry::builder()
        .register_workflow_typed("tokens", move |ctx: WorkflowContext, _: ()| {
            let calls = calls.clone();
            async move {
                let draw = move |n: u32| {
                    let calls = calls.clone();
                    move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        base + n
                    }
                };
                let root: u32 = ctx.side_effect(draw(0)).await;
                let a_draw = draw.clone();
                let a = ctx.spawn_with_handle(move |ctx| async move {
                    let first: u32 = ctx.side_effect(a_draw(10)).await;
                    ctx.yield_now().await;
                    let second: u32 = ctx.side_effect(a_draw(11)).await;
                    Ok::<_, WorkflowError>(vec![first, second])
                });
                let b_draw = draw.clone();
                let b = ctx.spawn_with_handle(move |ctx| async move {
                    let first: u32 = ctx.side_effect(b_draw(20)).await;
                    ctx.sleep(Duration::from_secs(1)).await?;
                    let second: u32 = ctx.side_effect(b_draw(21)).await;
                    Ok::<_, WorkflowError>(vec![first, second])
                });
                let a = a.await?;
                let b = b.await?;
                Ok::<_, WorkflowError>((root, a, b))
            }
        })
        .build()
        .unwrap()
}

#[test]
fn side_effect_ids_follow_call_order_across_threads() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = Arc::new(token_registry(0, calls.clone()));
    let mut instance = WorkflowInstance::new(registry, common::execution(), InstanceOptions::default());

    let start = vec![HistoryEvent::new(1, at(0), started("tokens", &()))];
    let first = instance.process_events(start.clone()).unwrap();
    // root draws, then a and b share a round, then a resumes after its yield.
    assert_eq!(
        first.commands,
        vec![
            side_effect_marker(1, 0),
            side_effect_marker(2, 10),
            side_effect_marker(3, 20),
            Command::StartTimer {
                id: 1,
                duration: Duration::from_secs(1)
            },
            side_effect_marker(4, 11),
        ]
    );

    let fired = vec![HistoryEvent::new(6, at(1), EventKind::TimerFired { timer_id: 1 })];
    let second = instance.process_events(fired.clone()).unwrap();
    assert_eq!(
        second.commands,
        vec![
            side_effect_marker(5, 21),
            Command::CompleteWorkflow {
                result: payload(&(0, vec![10, 11], vec![20, 21]))
            },
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    // Recorded markers sit between the start event and the timer.
    let mut history = RecordedHistory::new(common::execution());
    history.decisions.push(DecisionRecord {
        events: start,
        markers: DecisionRecord::marker_events(&first.commands, 2, at(0)),
        commands: first.commands,
    });
    history.decisions.push(DecisionRecord {
        events: fired,
        markers: DecisionRecord::marker_events(&second.commands, 7, at(1)),
        commands: second.commands,
    });

    let replay_calls = Arc::new(AtomicU32::new(0));
    WorkflowReplayer::new(Arc::new(token_registry(1000, replay_calls.clone())))
        .replay(&history)
        .unwrap();
    assert_eq!(replay_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn local_activity_result_does_not_move_the_workflow_clock() {
    let registry = Arc::new(
        Registry::builder()
            .register_workflow_typed("stamped", |ctx: WorkflowContext, _: ()| async move {
                let _: u32 = ctx.execute_local_activity("lookup", &()).await?;
                Ok::<_, WorkflowError>(ctx.now().timestamp())
            })
            .build()
            .unwrap(),
    );
    let mut instance = WorkflowInstance::new(registry.clone(), common::execution(), InstanceOptions::default());
    let start = vec![HistoryEvent::new(1, at(0), started("stamped", &()))];
    let first = instance.process_events(start.clone()).unwrap();

    let result = vec![HistoryEvent::new(
        2,
        at(50),
        EventKind::LocalActivityResult {
            id: 1,
            outcome: Ok(payload(&7)),
        },
    )];
    let second = instance.process_events(result.clone()).unwrap();
    assert_eq!(
        second.commands.last(),
        Some(&Command::CompleteWorkflow {
            result: payload(&at(0).timestamp())
        })
    );

    let mut history = RecordedHistory::new(common::execution());
    history.decisions.push(DecisionRecord {
        events: start,
        markers: Vec::new(),
        commands: first.commands,
    });
    history.decisions.push(DecisionRecord {
        events: result,
        markers: DecisionRecord::marker_events(&second.commands, 3, at(60)),
        commands: second.commands,
    });
    WorkflowReplayer::new(registry).replay(&history).unwrap();
}
