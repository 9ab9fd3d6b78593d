mod common;

use std::time::Duration;

use common::{config, start, TestResult};
use serde_json::json;
use taskd_core::{errno, ErrorKind, Task, TaskState};
use taskd_dispatcher::Config;

fn overlaps(a: &Task, b: &Task) -> bool {
    a.started_at < b.finished_at && b.started_at < a.finished_at
}

#[tokio::test]
async fn test_disjoint_resources_run_concurrently() -> TestResult {
    let h = start(config());
    h.register_resource("disk:diskA");
    h.register_resource("disk:diskB");

    let a = h.submit("test.sleep", vec![json!(0.5), json!(["disk:diskA"])])?;
    let b = h.submit("test.sleep", vec![json!(0.5), json!(["disk:diskB"])])?;
    let a = h.wait(a).await?;
    let b = h.wait(b).await?;

    assert_eq!(a.state, TaskState::Finished);
    assert_eq!(b.state, TaskState::Finished);
    assert!(overlaps(&a, &b), "tasks on different disks should overlap");
    assert_eq!(h.spawner.spawned(), 2);
    h.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_shared_resource_is_exclusive() -> TestResult {
    let h = start(config());
    h.register_resource("disk:diskA");

    let a = h.submit("test.sleep", vec![json!(0.2), json!(["disk:diskA"])])?;
    let b = h.submit("test.sleep", vec![json!(0.2), json!(["disk:diskA"])])?;
    let mut ended = vec![h.wait(a).await?, h.wait(b).await?];
    ended.sort_by_key(|t| t.started_at);

    assert!(ended.iter().all(|t| t.state == TaskState::Finished));
    assert!(!overlaps(&ended[0], &ended[1]));
    assert!(ended[1].started_at >= ended[0].finished_at);
    assert!(!h.balancer.resources().is_held("disk:diskA"));
    h.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_waiting_task_starts_when_resource_frees() -> TestResult {
    let h = start(config());
    h.register_resource("disk:diskA");

    let first = h.submit("test.sleep", vec![json!(0.3), json!(["disk:diskA"])])?;
    h.wait_for_state(first, TaskState::Executing).await?;
    let second = h.submit("test.sleep", vec![json!(0), json!(["disk:diskA"])])?;
    let waiting = h.wait_for_state(second, TaskState::Waiting).await?;
    assert!(waiting.started_at.is_none());
    assert!(h.balancer.resources().is_held("disk:diskA"));

    let second = h.wait(second).await?;
    let first = h.wait(first).await?;
    assert_eq!(second.state, TaskState::Finished);
    assert!(second.started_at >= first.finished_at);
    h.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_missing_resource_is_a_deadlock() -> TestResult {
    let h = start(config());

    let id = h.submit("test.sleep", vec![json!(0), json!(["disk:nowhere"])])?;
    let task = h.wait(id).await?;

    assert_eq!(task.state, TaskState::Aborted);
    let error = task.error.ok_or("missing error")?;
    assert_eq!(error.kind, ErrorKind::TaskAbortException);
    assert_eq!(error.code, errno::EDEADLK);
    assert!(task.started_at.is_none());
    assert_eq!(h.spawner.spawned(), 0);
    h.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_deadlock_detected_when_last_task_exits() -> TestResult {
    let h = start(config());

    let first = h.submit("test.sleep", vec![json!(0.3)])?;
    h.wait_running(first).await?;
    let stuck = h.submit("test.sleep", vec![json!(0), json!(["disk:nowhere"])])?;
    h.wait_for_state(stuck, TaskState::Waiting).await?;

    // Another task is running, so the missing resource may still appear.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let task = h.balancer.get_task(stuck)?.ok_or("task missing")?;
    assert_eq!(task.state, TaskState::Waiting);

    let stuck = h.wait(stuck).await?;
    let first = h.wait(first).await?;
    assert_eq!(first.state, TaskState::Finished);
    assert_eq!(stuck.state, TaskState::Aborted);
    assert_eq!(stuck.error.map(|e| e.code), Some(errno::EDEADLK));
    assert!(stuck.started_at.is_none());
    assert!(stuck.finished_at >= first.finished_at);
    h.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_registered_resource_starts_waiting_task() -> TestResult {
    let h = start(config());

    let long = h.submit("test.sleep", vec![json!(30)])?;
    h.wait_running(long).await?;
    let waiting = h.submit("test.sleep", vec![json!(0), json!(["pool:tank"])])?;
    h.wait_for_state(waiting, TaskState::Waiting).await?;

    let register = h.submit(
        "test.register_resource",
        vec![json!("pool:tank"), json!(["system"])],
    )?;
    let waiting = h.wait(waiting).await?;
    let register = h.wait(register).await?;
    assert_eq!(waiting.state, TaskState::Finished);
    assert_eq!(register.state, TaskState::Finished);
    // Started by the registration itself, not by the registering task's exit.
    assert!(waiting.started_at < register.finished_at);
    assert_eq!(
        h.balancer.get_task(long)?.map(|t| t.state),
        Some(TaskState::Executing)
    );

    h.balancer.abort(long, None).await?;
    h.wait(long).await?;
    h.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_bounded_pool_runs_hooks_and_subtasks() -> TestResult {
    let h = start(Config {
        max_executors: Some(1),
        ..config()
    });

    let id = h.submit(
        "test.subtasks",
        vec![json!([["test.echo", ["hello"]], ["test.sleep", [0]]])],
    )?;
    let parent = h.wait(id).await?;
    assert_eq!(parent.state, TaskState::Finished);
    assert_eq!(parent.result, Some(json!(["FINISHED", "FINISHED"])));
    assert!(h.balancer.executors().len() > 1);

    let hooked = h.submit("test.hooked", vec![json!(true)])?;
    let hooked = h.wait(hooked).await?;
    assert_eq!(hooked.state, TaskState::Finished);
    assert_eq!(hooked.subtask_ids.len(), 2);

    // Top-level tasks still share the capped slot once it is free.
    let next = h.submit("test.echo", vec![json!(1)])?;
    assert_eq!(h.wait(next).await?.state, TaskState::Finished);
    h.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_bounded_pool_reuses_executor() -> TestResult {
    let h = start(Config {
        max_executors: Some(1),
        ..config()
    });

    let ids = (0..3)
        .map(|i| h.submit("test.echo", vec![json!(i)]))
        .collect::<Result<Vec<_>, _>>()?;
    for (i, id) in ids.into_iter().enumerate() {
        let task = h.wait(id).await?;
        assert_eq!(task.state, TaskState::Finished);
        assert_eq!(task.result, Some(json!([i])));
    }

    assert_eq!(h.spawner.spawned(), 1);
    assert_eq!(h.balancer.executors().len(), 1);
    h.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_join_waits_for_subtasks() -> TestResult {
    let h = start(config());

    let id = h.submit(
        "test.subtasks",
        vec![json!([["test.echo", ["hello"]], ["test.sleep", [0.1]]])],
    )?;
    let parent = h.wait(id).await?;

    assert_eq!(parent.state, TaskState::Finished);
    assert_eq!(parent.result, Some(json!(["FINISHED", "FINISHED"])));
    assert_eq!(parent.subtask_ids.len(), 2);
    for sub in &parent.subtask_ids {
        let child = h.balancer.get_task(*sub)?.ok_or("subtask missing")?;
        assert_eq!(child.parent, Some(id));
        assert_eq!(child.user.as_deref(), Some("root"));
        assert!(child.finished_at <= parent.finished_at);
    }
    h.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_failed_subtask_is_reported_to_parent() -> TestResult {
    let h = start(config());

    let id = h.submit(
        "test.subtasks",
        vec![json!([["test.fail", ["run", "child failed"]]])],
    )?;
    let parent = h.wait(id).await?;

    assert_eq!(parent.state, TaskState::Finished);
    assert_eq!(parent.result, Some(json!(["FAILED"])));
    let child = h
        .balancer
        .get_task(parent.subtask_ids[0])?
        .ok_or("subtask missing")?;
    assert_eq!(child.error.map(|e| e.message), Some("child failed".to_string()));
    h.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_subtask_verify_error_reaches_parent() -> TestResult {
    let h = start(config());

    let id = h.submit(
        "test.subtasks",
        vec![json!([["test.fail", ["verify", "not now"]]])],
    )?;
    let parent = h.wait(id).await?;

    assert_eq!(parent.state, TaskState::Failed);
    let error = parent.error.ok_or("missing error")?;
    assert_eq!(error.message, "not now");
    assert!(parent.subtask_ids.is_empty());
    h.shutdown();
    Ok(())
}
