#![allow(clippy::unwrap_used)]

mod common;

use common::{Harness, payload};
use duroflow::{Command, EventKind, Registry, TestWorkflowEnvironment, WorkflowContext, WorkflowError};

fn messenger() -> Registry {
    Registry::builder()
        .register_workflow_typed("messenger", |ctx: WorkflowContext, _: ()| async move {
            ctx.signal_external_workflow("peer", None, "ping", "hello").await?;
            let cancel = ctx.request_cancel_external_workflow("other", Some("r-9")).await;
            Ok::<_, WorkflowError>(cancel.err())
        })
        .build()
        .unwrap()
}

#[test]
fn signal_then_cancel_another_workflow() {
    let mut h = Harness::new(messenger());
    let first = h.start("messenger", &());
    assert_eq!(
        first.commands,
        vec![Command::SignalExternalWorkflow {
            id: 1,
            workflow_id: "peer".into(),
            run_id: None,
            signal_name: "ping".into(),
            input: payload("hello"),
            child_workflow_only: false,
        }]
    );

    let second = h.deliver(vec![EventKind::ExternalSignalCompleted { initiated_id: 1 }]);
    assert_eq!(
        second.commands,
        vec![Command::RequestCancelExternalWorkflow {
            id: 2,
            workflow_id: "other".into(),
            run_id: Some("r-9".into()),
            child_workflow_only: false,
        }]
    );

    let third = h.deliver(vec![EventKind::ExternalCancelFailed {
        initiated_id: 2,
        failure: WorkflowError::generic("unknown execution"),
    }]);
    assert_eq!(
        third.commands,
        vec![Command::CompleteWorkflow {
            result: payload(&Some(WorkflowError::generic("unknown execution")))
        }]
    );
}

#[test]
fn failed_signal_fails_the_workflow() {
    let mut h = Harness::new(messenger());
    h.start("messenger", &());
    let outcome = h.deliver(vec![EventKind::ExternalSignalFailed {
        initiated_id: 1,
        failure: WorkflowError::generic("peer is closed"),
    }]);
    assert_eq!(
        outcome.commands,
        vec![Command::FailWorkflow {
            failure: WorkflowError::generic("peer is closed")
        }]
    );
}

#[tokio::test]
async fn test_environment_acknowledges_external_requests() {
    let env = TestWorkflowEnvironment::new(messenger());
    let run = env.execute_workflow("messenger", &()).await.unwrap();
    assert_eq!(run.result_as::<Option<WorkflowError>>().unwrap(), None);
    assert_eq!(run.history.decisions.len(), 3);
}
