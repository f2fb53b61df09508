mod common;

use std::sync::Arc;

use cpsflow::runtime::{FlowDefinition, InterruptCause};
use cpsflow::steps::{InputStep, StageRegistry, StageStep};
use cpsflow::{DirectoryOwner, FlowEnvironment, FlowResult, StepRegistry};
use serde_json::{json, Value};
use tempfile::TempDir;

use common::{end_failure, environment, eventually, finish, start, start_build, wait_threads};

#[tokio::test]
async fn parallel_collects_branch_values() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "let r = parallel(a: { 'one' }, b: { 'two' }); echo(r.a + '-' + r.b)",
        environment(),
    )
    .await?;
    assert_eq!(finish(&execution).await?, FlowResult::Success);
    assert_eq!(execution.console(), vec!["one-two".to_string()]);
    Ok(())
}

#[tokio::test]
async fn parallel_waits_for_all_branches_before_failing() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "parallel(a: { error('boom') }, b: { echo('b') })",
        environment(),
    )
    .await?;
    assert_eq!(finish(&execution).await?, FlowResult::Failure);
    assert_eq!(execution.console(), vec!["b".to_string()]);
    let failure = end_failure(&execution)?.unwrap_or_default();
    assert!(failure.contains("Failed in branch a: boom"), "{failure}");
    Ok(())
}

#[tokio::test]
async fn fail_fast_cancels_waiting_branches() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "parallel(b: { pause(); echo('late') }, a: { error('boom') }, failFast: true)",
        environment(),
    )
    .await?;
    assert_eq!(finish(&execution).await?, FlowResult::Failure);
    assert!(!execution.console().contains(&"late".to_string()));
    let failure = end_failure(&execution)?.unwrap_or_default();
    assert!(failure.contains("boom"), "{failure}");
    Ok(())
}

#[tokio::test]
async fn parallel_rejects_duplicate_branch_names() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "parallel(a: { echo('x') }, a: { echo('y') })",
        environment(),
    )
    .await?;
    assert_eq!(finish(&execution).await?, FlowResult::Failure);
    assert!(execution.console().is_empty());
    let failure = end_failure(&execution)?.unwrap_or_default();
    assert!(failure.contains("duplicate branch name `a`"), "{failure}");
    Ok(())
}

#[tokio::test]
async fn input_proceed_returns_value() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "let answer = input('approve', 'Ship it?'); echo('answer ' + answer)",
        environment(),
    )
    .await?;
    let url = execution.url();
    assert_eq!(InputStep::pending_ids(&url), vec!["approve".to_string()]);
    assert!(execution.console().contains(&"Ship it?".to_string()));

    InputStep::proceed(&url, "approve", json!("yes"))?;
    assert_eq!(finish(&execution).await?, FlowResult::Success);
    assert!(execution.console().contains(&"answer yes".to_string()));
    assert!(InputStep::pending_ids(&url).is_empty());
    assert!(InputStep::proceed(&url, "approve", Value::Null).is_err());
    Ok(())
}

#[tokio::test]
async fn input_abort_marks_flow_aborted() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(&dir, "input('approve'); echo('shipped')", environment()).await?;
    InputStep::abort(&execution.url(), "approve", Some("alice".to_string()))?;
    assert_eq!(finish(&execution).await?, FlowResult::Aborted);
    assert!(!execution.console().contains(&"shipped".to_string()));
    let failure = end_failure(&execution)?.unwrap_or_default();
    assert!(failure.contains("Aborted by alice"), "{failure}");
    Ok(())
}

#[tokio::test]
async fn interrupt_stops_pending_input() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(&dir, "input('approve'); echo('shipped')", environment()).await?;
    let url = execution.url();
    execution
        .interrupt(
            FlowResult::Aborted,
            vec![InterruptCause::User {
                name: Some("bob".to_string()),
            }],
        )
        .await?;
    assert_eq!(finish(&execution).await?, FlowResult::Aborted);
    assert!(InputStep::pending_ids(&url).is_empty());
    let failure = end_failure(&execution)?.unwrap_or_default();
    assert!(failure.contains("Aborted by bob"), "{failure}");
    Ok(())
}

#[tokio::test]
async fn caught_interrupt_can_be_observed() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "try { pause() } catch (e) { echo(e.type) }",
        environment(),
    )
    .await?;
    execution.interrupt(FlowResult::Aborted, Vec::new()).await?;
    finish(&execution).await?;
    assert_eq!(execution.console(), vec!["interrupted".to_string()]);
    Ok(())
}

#[tokio::test]
async fn newer_build_supersedes_waiting_build() -> anyhow::Result<()> {
    let registry = StageRegistry::new();
    let env = || {
        FlowEnvironment::new(
            StepRegistry::with_builtins().with_step(Arc::new(StageStep::new(registry.clone()))),
        )
    };
    let job = "stage-supersede";
    let script = "stage('deploy', concurrency: 1); input('ship')";
    let dirs = [TempDir::new()?, TempDir::new()?, TempDir::new()?];

    let first = start_build(dirs[0].path(), job, 1, script, env()).await?;
    assert_eq!(registry.holders(job, "deploy"), vec![1]);
    assert_eq!(InputStep::pending_ids(&first.url()), vec!["ship".to_string()]);

    let second = start_build(dirs[1].path(), job, 2, script, env()).await?;
    assert_eq!(registry.waiting(job, "deploy"), Some(2));
    assert!(InputStep::pending_ids(&second.url()).is_empty());

    let third = start_build(dirs[2].path(), job, 3, script, env()).await?;
    assert_eq!(finish(&second).await?, FlowResult::NotBuilt);
    let failure = end_failure(&second)?.unwrap_or_default();
    assert!(failure.contains("Superseded by stage-supersede#3"), "{failure}");
    assert_eq!(registry.waiting(job, "deploy"), Some(3));

    InputStep::proceed(&first.url(), "ship", Value::Null)?;
    assert_eq!(finish(&first).await?, FlowResult::Success);
    let third_url = third.url();
    eventually("third build admitted", || {
        InputStep::pending_ids(&third_url).contains(&"ship".to_string())
    })
    .await?;
    assert_eq!(registry.holders(job, "deploy"), vec![3]);

    InputStep::proceed(&third_url, "ship", Value::Null)?;
    assert_eq!(finish(&third).await?, FlowResult::Success);
    assert!(registry.holders(job, "deploy").is_empty());
    Ok(())
}

#[tokio::test]
async fn load_runs_script_from_execution_directory() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("lib.flow"), "echo('in lib'); return 'lib value'")?;
    let execution = start(&dir, "let v = load('lib.flow'); echo(v)", environment()).await?;
    assert_eq!(finish(&execution).await?, FlowResult::Success);
    assert_eq!(
        execution.console(),
        vec!["in lib".to_string(), "lib value".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn loaded_script_resumes_after_reload() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("lib.flow"), "let v = pause(); return 'got ' + v")?;
    let execution = start(&dir, "echo(load('lib.flow'))", environment()).await?;
    wait_threads(&execution, 2).await?;
    drop(execution);
    std::fs::remove_file(dir.path().join("lib.flow"))?;

    let reloaded = common::reload(&dir, environment()).await?;
    let body = reloaded
        .thread_dump()
        .await?
        .into_iter()
        .find(|thread| thread.owner.is_some())
        .map(|thread| thread.id)
        .ok_or_else(|| anyhow::anyhow!("no script thread"))?;
    reloaded
        .resume_thread(body, cpsflow::Outcome::success(json!(7)))
        .await?;
    assert_eq!(finish(&reloaded).await?, FlowResult::Success);
    assert_eq!(reloaded.console(), vec!["got 7".to_string()]);
    Ok(())
}

#[tokio::test]
async fn sandbox_rejects_trusted_steps() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("lib.flow"), "echo('in lib')")?;
    let execution = FlowDefinition::new("load('lib.flow')")
        .sandboxed(true)
        .create_execution(Arc::new(DirectoryOwner::new(dir.path())), environment());
    execution.start().await?;
    assert_eq!(finish(&execution).await?, FlowResult::Failure);
    assert!(execution.console().is_empty());
    let failure = end_failure(&execution)?.unwrap_or_default();
    assert!(
        failure.contains("Scripts not permitted to use step `load` in a sandbox"),
        "{failure}"
    );
    Ok(())
}

#[tokio::test]
async fn with_env_scopes_variables_to_body() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "withEnv(['STAGE=outer']) { withEnv(['STAGE=inner', 'EXTRA=1']) { echo(getEnv('STAGE') + getEnv('EXTRA')) }; echo(getEnv('STAGE')) }; echo(getEnv('STAGE'))",
        environment(),
    )
    .await?;
    assert_eq!(finish(&execution).await?, FlowResult::Success);
    assert_eq!(
        execution.console(),
        vec!["inner1".to_string(), "outer".to_string(), "null".to_string()]
    );
    Ok(())
}
