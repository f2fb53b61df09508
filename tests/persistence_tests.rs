mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use cpsflow::runtime::{Outcome, PROGRAM_FILE};
use cpsflow::state::LiveResource;
use cpsflow::{
    FlowEnvironment, FlowError, FlowResult, PickleFactory, PickleRegistry, Result, StepArgs,
    StepContext, StepDescriptor, StepExecution, StepRegistry,
};
use serde_json::Value;
use tempfile::TempDir;

use common::{end_failure, finish, reload, start, wait_threads};

/// 异步步骤，保存状态时抛错
struct Fragile;

impl StepDescriptor for Fragile {
    fn function_name(&self) -> &str {
        "fragile"
    }

    fn new_execution(&self, _args: StepArgs, context: StepContext) -> Result<Box<dyn StepExecution>> {
        Ok(Box::new(FragileExecution { context }))
    }

    fn restore(&self, _state: Value, context: StepContext) -> Result<Box<dyn StepExecution>> {
        Ok(Box::new(FragileExecution { context }))
    }
}

struct FragileExecution {
    context: StepContext,
}

impl StepExecution for FragileExecution {
    fn context(&self) -> &StepContext {
        &self.context
    }

    fn start(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn save_state(&self) -> Result<Value> {
        Err(FlowError::Other(anyhow!("disk cartridge jammed")))
    }
}

fn fragile_environment() -> FlowEnvironment {
    FlowEnvironment::new(StepRegistry::with_builtins().with_step(Arc::new(Fragile)))
}

#[tokio::test]
async fn save_failure_fails_the_flow_and_survives_reload() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(&dir, "echo('before'); fragile(); echo('after')", fragile_environment()).await?;
    assert_eq!(finish(&execution).await?, FlowResult::Failure);
    assert_eq!(execution.console(), vec!["before".to_string()]);
    let failure = end_failure(&execution)?.unwrap_or_default();
    assert!(failure.contains("disk cartridge jammed"), "{failure}");
    drop(execution);

    let reloaded = reload(&dir, fragile_environment()).await?;
    assert!(reloaded.is_complete());
    assert_eq!(reloaded.result(), FlowResult::Failure);
    let failure = end_failure(&reloaded)?.unwrap_or_default();
    assert!(failure.contains("disk cartridge jammed"), "{failure}");
    Ok(())
}

#[tokio::test]
async fn unknown_step_in_saved_state_fails_on_load() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(&dir, "input('go')", common::environment()).await?;
    assert!(dir.path().join(PROGRAM_FILE).exists());
    drop(execution);

    let without_input = FlowEnvironment::new(StepRegistry::new());
    let reloaded = reload(&dir, without_input).await?;
    assert_eq!(finish(&reloaded).await?, FlowResult::Failure);
    let failure = end_failure(&reloaded)?.unwrap_or_default();
    assert!(failure.contains("Failed to load persisted workflow state"), "{failure}");
    assert!(failure.contains("input"), "{failure}");
    Ok(())
}

struct Agents {
    online: Arc<AtomicBool>,
    rehydrated: Arc<AtomicUsize>,
}

#[async_trait]
impl PickleFactory for Agents {
    fn kind(&self) -> &str {
        "agent"
    }

    async fn rehydrate(&self, key: &str) -> anyhow::Result<LiveResource> {
        if !self.online.load(Ordering::SeqCst) {
            anyhow::bail!("agent {key} is offline");
        }
        self.rehydrated.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(format!("channel-{key}")))
    }
}

fn agent_environment(online: &Arc<AtomicBool>, rehydrated: &Arc<AtomicUsize>) -> FlowEnvironment {
    let pickles = PickleRegistry::new().with_factory(Arc::new(Agents {
        online: online.clone(),
        rehydrated: rehydrated.clone(),
    }));
    common::environment().with_pickles(pickles)
}

#[tokio::test]
async fn resources_are_rehydrated_before_threads_resume() -> anyhow::Result<()> {
    let online = Arc::new(AtomicBool::new(true));
    let rehydrated = Arc::new(AtomicUsize::new(0));
    let dir = TempDir::new()?;
    let script = "withResource('agent', 'linux') { let v = pause(); echo('resumed ' + v) }";
    let execution = start(&dir, script, agent_environment(&online, &rehydrated)).await?;
    wait_threads(&execution, 2).await?;
    assert_eq!(rehydrated.load(Ordering::SeqCst), 1);

    let saved: Value = serde_json::from_slice(&std::fs::read(dir.path().join(PROGRAM_FILE))?)?;
    assert_eq!(saved["pickles"][0]["kind"], "agent");
    assert_eq!(saved["pickles"][0]["key"], "linux");
    drop(execution);

    let reloaded = reload(&dir, agent_environment(&online, &rehydrated)).await?;
    assert_eq!(rehydrated.load(Ordering::SeqCst), 2);
    let threads = reloaded.thread_dump().await?;
    let body = threads
        .iter()
        .find(|thread| thread.owner.is_some())
        .map(|thread| thread.id)
        .ok_or_else(|| anyhow!("no body thread"))?;
    reloaded
        .resume_thread(body, Outcome::success(Value::from("ok")))
        .await?;
    assert_eq!(finish(&reloaded).await?, FlowResult::Success);
    assert_eq!(reloaded.console(), vec!["resumed ok".to_string()]);
    Ok(())
}

#[tokio::test]
async fn offline_resource_fails_the_reload() -> anyhow::Result<()> {
    let online = Arc::new(AtomicBool::new(true));
    let rehydrated = Arc::new(AtomicUsize::new(0));
    let dir = TempDir::new()?;
    let script = "withResource('agent', 'mac') { pause() }";
    let execution = start(&dir, script, agent_environment(&online, &rehydrated)).await?;
    wait_threads(&execution, 2).await?;
    drop(execution);

    online.store(false, Ordering::SeqCst);
    let reloaded = reload(&dir, agent_environment(&online, &rehydrated)).await?;
    assert_eq!(finish(&reloaded).await?, FlowResult::Failure);
    let failure = end_failure(&reloaded)?.unwrap_or_default();
    assert!(failure.contains("Failed to load persisted workflow state"), "{failure}");
    assert!(failure.contains("mac"), "{failure}");
    assert!(failure.contains("offline"), "{failure}");
    Ok(())
}

#[tokio::test]
async fn sleep_stops_on_interrupt_and_rearms_after_reload() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "sleep(time: 300, unit: 'MILLISECONDS'); echo('woke')",
        common::environment(),
    )
    .await?;
    let threads = execution.thread_dump().await?;
    assert_eq!(threads[0].step.as_deref(), Some("sleep"));
    execution
        .interrupt(FlowResult::Aborted, Vec::new())
        .await?;
    assert_eq!(finish(&execution).await?, FlowResult::Aborted);

    let dir = TempDir::new()?;
    let execution = start(
        &dir,
        "sleep(time: 200, unit: 'MILLISECONDS'); echo('woke')",
        common::environment(),
    )
    .await?;
    assert!(dir.path().join(PROGRAM_FILE).exists());
    let copy = TempDir::new()?;
    common::copy_dir(dir.path(), copy.path())?;
    execution.interrupt(FlowResult::Aborted, Vec::new()).await?;
    assert_eq!(finish(&execution).await?, FlowResult::Aborted);

    let reloaded = reload(&copy, common::environment()).await?;
    assert_eq!(finish(&reloaded).await?, FlowResult::Success);
    assert_eq!(reloaded.console(), vec!["woke".to_string()]);
    Ok(())
}

#[tokio::test]
async fn step_finished_before_save_completes_after_reload() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let execution = start(&dir, "let v = input('go'); echo('after ' + v)", common::environment()).await?;
    wait_threads(&execution, 1).await?;
    drop(execution);

    let path = dir.path().join(PROGRAM_FILE);
    let mut saved: Value = serde_json::from_slice(&std::fs::read(&path)?)?;
    assert_eq!(saved["threads"][0]["step"]["context"]["function"], "input");
    saved["threads"][0]["step"]["context"]["outcome"] = serde_json::json!({"kind": "normal", "value": "ok"});
    std::fs::write(&path, serde_json::to_vec(&saved)?)?;

    let reloaded = reload(&dir, common::environment()).await?;
    assert_eq!(finish(&reloaded).await?, FlowResult::Success);
    assert!(reloaded.console().contains(&"after ok".to_string()));
    Ok(())
}
