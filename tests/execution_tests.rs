mod common;

use cpsflow::runtime::PROGRAM_FILE;
use cpsflow::{FlowNodeKind, FlowResult, Outcome};
use serde_json::{json, Value};
use tempfile::TempDir;

use common::{atoms, environment, finish, nodes, reload, start, wait_threads};

#[tokio::test]
async fn pause_persists_and_resume_completes() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(&dir, "echo('A'); pause(); echo('B')", environment()).await?;

    let threads = execution.thread_dump().await?;
    assert_eq!(threads.len(), 1);
    assert!(!threads[0].runnable);
    assert!(threads[0].step.is_none());
    assert!(dir.path().join(PROGRAM_FILE).exists());
    assert_eq!(execution.console(), vec!["A".to_string()]);
    assert!(!execution.is_complete());

    execution.resume_thread(threads[0].id, Outcome::null()).await?;
    assert_eq!(finish(&execution).await?, FlowResult::Success);
    assert_eq!(execution.console(), vec!["A".to_string(), "B".to_string()]);
    assert!(!dir.path().join(PROGRAM_FILE).exists());

    let graph = nodes(&execution)?;
    assert_eq!(graph.len(), 4);
    assert_eq!(atoms(&execution)?, vec!["echo".to_string(), "echo".to_string()]);
    assert!(matches!(graph[0].kind, FlowNodeKind::FlowEnd { result: FlowResult::Success, .. }));
    assert!(graph.iter().any(|node| node.kind == FlowNodeKind::FlowStart));
    Ok(())
}

#[tokio::test]
async fn resumed_value_survives_restart() -> anyhow::Result<()> {
    let script = "let v = pause(); echo('got ' + v)";

    let live_dir = TempDir::new()?;
    let live = start(&live_dir, script, environment()).await?;
    live.resume_thread(0, Outcome::success(json!(5))).await?;
    let live_result = finish(&live).await?;

    let dir = TempDir::new()?;
    let first = start(&dir, script, environment()).await?;
    drop(first);
    let reloaded = reload(&dir, environment()).await?;
    let threads = reloaded.thread_dump().await?;
    assert_eq!(threads.len(), 1);
    reloaded.resume_thread(threads[0].id, Outcome::success(json!(5))).await?;

    assert_eq!(finish(&reloaded).await?, live_result);
    assert_eq!(reloaded.console(), live.console());
    assert_eq!(reloaded.console(), vec!["got 5".to_string()]);
    Ok(())
}

#[tokio::test]
async fn double_resume_is_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(&dir, "pause(); pause()", environment()).await?;
    execution.run_in_vm(|group| {
        let first = group.resume(0, Outcome::null());
        let second = group.resume(0, Outcome::null());
        assert!(first.is_ok());
        assert!(matches!(second, Err(cpsflow::FlowError::ThreadAlreadyResumed(0))));
    })?;
    execution.wait_for_suspension().await?;
    let threads = execution.thread_dump().await?;
    assert_eq!(threads.len(), 1);
    assert!(!threads[0].runnable);
    Ok(())
}

#[tokio::test]
async fn threads_woken_in_a_pass_run_before_saving() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "pause(); parallel(a: { pause() }, b: { echo('b') }); echo('done')",
        environment(),
    )
    .await?;
    execution.resume_thread(0, Outcome::null()).await?;
    wait_threads(&execution, 2).await?;

    let threads = execution.thread_dump().await?;
    assert!(threads.iter().all(|thread| !thread.runnable));
    assert_eq!(execution.console(), vec!["b".to_string()]);

    let saved: Value = serde_json::from_slice(&std::fs::read(dir.path().join(PROGRAM_FILE))?)?;
    let saved_threads = saved["threads"].as_array().cloned().unwrap_or_default();
    assert_eq!(saved_threads.len(), 2);
    assert!(saved_threads
        .iter()
        .all(|thread| thread.get("resume_value").map_or(true, Value::is_null)));
    Ok(())
}

#[tokio::test]
async fn synchronous_body_creates_no_thread() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(&dir, "withEnv(['A=1']) { echo(getEnv('A')) }; pause()", environment()).await?;
    assert_eq!(execution.thread_dump().await?.len(), 1);
    assert_eq!(execution.console(), vec!["1".to_string()]);

    let dir = TempDir::new()?;
    let execution = start(&dir, "withEnv(['A=1']) { pause() }", environment()).await?;
    let threads = execution.thread_dump().await?;
    assert_eq!(threads.len(), 2);
    assert_eq!(threads[0].step.as_deref(), Some("withEnv"));
    assert_eq!(threads[1].owner, Some(threads[0].id));
    Ok(())
}

#[tokio::test]
async fn synchronous_body_leaves_thread_ids_dense() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "withEnv(['A=1']) { echo('a') }; withEnv(['A=1']) { withEnv(['B=2']) { echo('b') }; pause() }",
        environment(),
    )
    .await?;
    let ids: Vec<_> = execution.thread_dump().await?.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![0, 1]);
    assert_eq!(execution.console(), vec!["a".to_string(), "b".to_string()]);

    execution.resume_thread(1, Outcome::null()).await?;
    assert_eq!(finish(&execution).await?, FlowResult::Success);
    Ok(())
}

#[tokio::test]
async fn body_nodes_are_bracketed() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(&dir, "retry(3) { echo('x') }", environment()).await?;
    assert_eq!(finish(&execution).await?, FlowResult::Success);

    let graph = nodes(&execution)?;
    let starts = graph
        .iter()
        .filter(|n| matches!(n.kind, FlowNodeKind::StepStart { .. }))
        .count();
    let ends = graph
        .iter()
        .filter(|n| matches!(n.kind, FlowNodeKind::StepEnd { .. }))
        .count();
    assert_eq!(starts, 2);
    assert_eq!(ends, 2);
    let body_start = graph
        .iter()
        .find(|n| {
            n.is_block_start()
                && execution
                    .actions(&n.id)
                    .map(|a| a.contains(&cpsflow::NodeAction::BodyInvocation))
                    .unwrap_or(false)
        })
        .expect("body start node");
    assert_eq!(body_start.function_name(), Some("retry"));
    Ok(())
}

#[tokio::test]
async fn retry_reruns_failing_body() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "retry(3) { echo('attempt'); error('flaky') }",
        environment(),
    )
    .await?;
    assert_eq!(finish(&execution).await?, FlowResult::Failure);
    let attempts = execution.console().iter().filter(|l| *l == "attempt").count();
    assert_eq!(attempts, 3);
    Ok(())
}

#[tokio::test]
async fn unknown_step_fails_with_line() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(&dir, "echo('a')\nfrobnicate()", environment()).await?;
    assert_eq!(finish(&execution).await?, FlowResult::Failure);
    let failure = common::end_failure(&execution)?.unwrap_or_default();
    assert!(failure.contains("frobnicate"), "{failure}");
    assert!(failure.contains("line 2"), "{failure}");
    Ok(())
}

#[tokio::test]
async fn caught_failure_keeps_success() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "try { error('bad') } catch (e) { echo('caught ' + e.message) }",
        environment(),
    )
    .await?;
    assert_eq!(finish(&execution).await?, FlowResult::Success);
    assert_eq!(execution.console(), vec!["caught bad".to_string()]);
    Ok(())
}

#[tokio::test]
async fn sleep_completes_after_deadline() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "sleep(time: 50, unit: 'MILLISECONDS'); echo('woke')",
        environment(),
    )
    .await?;
    assert_eq!(finish(&execution).await?, FlowResult::Success);
    assert_eq!(execution.console(), vec!["woke".to_string()]);
    Ok(())
}
