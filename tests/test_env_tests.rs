#![allow(clippy::unwrap_used)]

mod common;

use duroflow::{
    ActivityContext, ActivityOptions, ChildWorkflowOptions, Command, Registry, RegistryBuilder, RetryPolicy, Selectable,
    TestEnvError, TestWorkflowEnvironment, TimeoutType, WorkflowContext, WorkflowError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn builder() -> RegistryBuilder {
    Registry::builder()
}

#[tokio::test]
async fn virtual_clock_jumps_over_long_timers() {
    let registry = builder()
        .register_workflow_typed("daily", |ctx: WorkflowContext, _: ()| async move {
            let before = ctx.now();
            ctx.sleep(Duration::from_secs(24 * 60 * 60)).await?;
            let elapsed = ctx.now() - before;
            Ok::<_, WorkflowError>(elapsed.num_hours())
        })
        .build()
        .unwrap();
    let env = TestWorkflowEnvironment::new(registry);
    let run = env.execute_workflow("daily", &()).await.unwrap();
    assert_eq!(run.result_as::<i64>().unwrap(), 24);
    assert_eq!(run.history.decisions.len(), 2);
}

#[tokio::test]
async fn child_workflow_runs_to_completion() {
    let registry = builder()
        .register_workflow_typed("child", |ctx: WorkflowContext, name: String| async move {
            Ok::<_, WorkflowError>(format!("hello {name} from {}", ctx.info().execution.workflow_id))
        })
        .register_workflow_typed("parent", |ctx: WorkflowContext, _: ()| async move {
            let child = ctx
                .with_child_workflow_options(ChildWorkflowOptions::with_execution_timeout(Duration::from_secs(60)))
                .execute_child_workflow::<_, String>("child", "ada");
            let execution = child.execution().clone().await?;
            let greeting = child.await?;
            Ok::<_, WorkflowError>((execution.run_id, greeting))
        })
        .build()
        .unwrap();
    let env = TestWorkflowEnvironment::new(registry);
    let run = env.execute_workflow("parent", &()).await.unwrap();
    assert_eq!(
        run.result_as::<(String, String)>().unwrap(),
        (
            "default-test-run-id:child-1-run".to_string(),
            "hello ada from default-test-run-id:child-1".to_string()
        )
    );
}

#[tokio::test]
async fn unregistered_child_fails_in_the_parent() {
    let registry = builder()
        .register_workflow_typed("parent", |ctx: WorkflowContext, _: ()| async move {
            let outcome = ctx
                .with_child_workflow_options(ChildWorkflowOptions::with_execution_timeout(Duration::from_secs(60)))
                .execute_child_workflow::<_, String>("ghost", &())
                .await;
            Ok::<_, WorkflowError>(outcome.unwrap_err().to_string())
        })
        .build()
        .unwrap();
    let env = TestWorkflowEnvironment::new(registry);
    let run = env.execute_workflow("parent", &()).await.unwrap();
    assert_eq!(
        run.result_as::<String>().unwrap(),
        "workflow type 'ghost' is not registered"
    );
}

fn flaky_registry(attempts: Arc<AtomicU32>) -> Registry {
    builder()
        .register_activity_typed("flaky", move |ctx: ActivityContext, _: ()| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                if ctx.info().attempt < 3 {
                    return Err(WorkflowError::application("Unavailable", "try again"));
                }
                Ok(ctx.info().attempt)
            }
        })
        .register_workflow_typed("retrying", |ctx: WorkflowContext, max_attempts: u32| async move {
            let options = ActivityOptions {
                retry_policy: Some(RetryPolicy {
                    maximum_attempts: max_attempts,
                    ..RetryPolicy::default()
                }),
                ..common::activity_options()
            };
            let attempt: u32 = ctx.with_activity_options(options).execute_activity("flaky", &()).await?;
            Ok::<_, WorkflowError>(attempt)
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn activity_is_retried_until_it_succeeds() {
    let attempts = Arc::new(AtomicU32::new(0));
    let env = TestWorkflowEnvironment::new(flaky_registry(attempts.clone()));
    let run = env.execute_workflow("retrying", &5u32).await.unwrap();
    assert_eq!(run.result_as::<u32>().unwrap(), 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retries_stop_at_maximum_attempts() {
    let attempts = Arc::new(AtomicU32::new(0));
    let env = TestWorkflowEnvironment::new(flaky_registry(attempts.clone()));
    let run = env.execute_workflow("retrying", &2u32).await.unwrap();
    assert_eq!(
        run.result,
        Err(WorkflowError::application("Unavailable", "try again"))
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_activity_times_out() {
    let registry = builder()
        .register_activity_typed("slow", |_ctx: ActivityContext, _: ()| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, WorkflowError>(())
        })
        .register_workflow_typed("impatient", |ctx: WorkflowContext, _: ()| async move {
            let outcome = ctx
                .with_activity_options(ActivityOptions::with_start_to_close(Duration::from_secs(1)))
                .execute_activity::<_, ()>("slow", &())
                .await;
            Ok::<_, WorkflowError>(outcome.unwrap_err())
        })
        .build()
        .unwrap();
    let env = TestWorkflowEnvironment::new(registry);
    let run = env.execute_workflow("impatient", &()).await.unwrap();
    assert_eq!(
        run.result_as::<WorkflowError>().unwrap(),
        WorkflowError::timeout(TimeoutType::StartToClose)
    );
}

fn wait_for_approval() -> Registry {
    builder()
        .register_workflow_typed("approval", |ctx: WorkflowContext, _: ()| async move {
            let deadline = ctx.new_timer(Duration::from_secs(3600));
            let approvals = ctx.signal_channel("approve");
            let cases: [&dyn Selectable; 2] = [&deadline, &approvals];
            if ctx.select(&cases).await? == 1 {
                let by: Option<String> = approvals.receive_as(&ctx).await?;
                return Ok(format!("approved by {}", by.unwrap_or_default()));
            }
            // A cancelled deadline surfaces here as `Canceled`.
            deadline.await?;
            Ok::<_, WorkflowError>("expired".to_string())
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn delayed_signal_wins_against_a_later_timer() {
    let mut env = TestWorkflowEnvironment::new(wait_for_approval());
    env.signal_workflow_after(Duration::from_secs(60), "approve", "grace").unwrap();
    let run = env.execute_workflow("approval", &()).await.unwrap();
    assert_eq!(run.result_as::<String>().unwrap(), "approved by grace");
}

#[tokio::test]
async fn timer_wins_when_the_signal_is_too_late() {
    let mut env = TestWorkflowEnvironment::new(wait_for_approval());
    env.signal_workflow_after(Duration::from_secs(7200), "approve", "grace").unwrap();
    let run = env.execute_workflow("approval", &()).await.unwrap();
    assert_eq!(run.result_as::<String>().unwrap(), "expired");
}

#[tokio::test]
async fn cancellation_after_a_delay_cancels_the_run() {
    let mut env = TestWorkflowEnvironment::new(wait_for_approval());
    env.cancel_workflow_after(Duration::from_secs(10));
    let run = env.execute_workflow("approval", &()).await.unwrap();
    assert_eq!(run.result, Err(WorkflowError::canceled()));
    let last = run.history.decisions.last().unwrap();
    assert_eq!(
        last.commands,
        vec![Command::CancelTimer { id: 1 }, Command::CancelWorkflow { details: None }]
    );
}

#[tokio::test]
async fn workflow_waiting_forever_is_reported_as_stalled() {
    let registry = builder()
        .register_workflow_typed("forever", |ctx: WorkflowContext, _: ()| async move {
            let _ = ctx.signal_channel("never").receive(&ctx).await?;
            Ok::<_, WorkflowError>(())
        })
        .build()
        .unwrap();
    let env = TestWorkflowEnvironment::new(registry);
    let err = env.execute_workflow("forever", &()).await.unwrap_err();
    assert!(
        matches!(&err, TestEnvError::Stalled { workflow_id } if workflow_id == "default-test-workflow-id"),
        "{err:?}"
    );
}

#[tokio::test]
async fn unknown_activity_fails_with_supported_types() {
    let registry = builder()
        .register_activity_typed("known", |_ctx: ActivityContext, _: ()| async move { Ok::<_, WorkflowError>(()) })
        .register_workflow_typed("caller", |ctx: WorkflowContext, _: ()| async move {
            let outcome = ctx
                .with_activity_options(common::activity_options())
                .execute_activity::<_, ()>("unknown", &())
                .await;
            Ok::<_, WorkflowError>(outcome.unwrap_err())
        })
        .build()
        .unwrap();
    let env = TestWorkflowEnvironment::new(registry);
    let run = env.execute_workflow("caller", &()).await.unwrap();
    assert_eq!(
        run.result_as::<WorkflowError>().unwrap(),
        WorkflowError::generic("unable to find activityType=unknown. Supported types: [known]")
    );
}

#[tokio::test]
async fn closed_instance_still_answers_queries() {
    let registry = builder()
        .register_workflow_typed("answering", |ctx: WorkflowContext, _: ()| async move {
            ctx.set_query_handler("answer", |_: ()| Ok(42))
                .map_err(|e| WorkflowError::generic(e.to_string()))?;
            Ok::<_, WorkflowError>(())
        })
        .build()
        .unwrap();
    let env = TestWorkflowEnvironment::new(registry);
    let run = env.execute_workflow("answering", &()).await.unwrap();
    let answer = run.instance.query("answer", None).unwrap();
    assert_eq!(common::decode::<u32>(&answer), 42);
}
