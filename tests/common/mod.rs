#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use cpsflow::runtime::{DirectoryOwner, FlowDefinition, FlowEnvironment, FlowExecution};
use cpsflow::{FlowNode, FlowNodeKind, FlowResult, StepRegistry, StorageKind};
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn environment() -> FlowEnvironment {
    FlowEnvironment::new(StepRegistry::with_builtins())
}

pub fn memory_environment() -> FlowEnvironment {
    environment().with_storage(StorageKind::Memory)
}

/// 在临时目录中启动脚本并等待第一次挂起
pub async fn start(
    dir: &TempDir,
    script: &str,
    env: FlowEnvironment,
) -> anyhow::Result<Arc<FlowExecution>> {
    let execution = FlowDefinition::new(script)
        .create_execution(Arc::new(DirectoryOwner::new(dir.path())), env);
    execution.start().await?;
    within(execution.wait_for_suspension()).await??;
    Ok(execution)
}

pub async fn start_build(
    dir: &Path,
    job: &str,
    number: u64,
    script: &str,
    env: FlowEnvironment,
) -> anyhow::Result<Arc<FlowExecution>> {
    let execution = FlowDefinition::new(script).create_execution(
        Arc::new(DirectoryOwner::for_build(dir, job, number)),
        env,
    );
    execution.start().await?;
    within(execution.wait_for_suspension()).await??;
    Ok(execution)
}

/// 模拟进程重启：从同一目录重新加载
pub async fn reload(dir: &TempDir, env: FlowEnvironment) -> anyhow::Result<Arc<FlowExecution>> {
    let execution = FlowExecution::load(Arc::new(DirectoryOwner::new(dir.path())), env).await?;
    within(execution.wait_for_suspension()).await??;
    Ok(execution)
}

pub async fn finish(execution: &FlowExecution) -> anyhow::Result<FlowResult> {
    Ok(within(execution.wait_for_completion()).await??)
}

pub async fn within<F: Future>(future: F) -> anyhow::Result<F::Output> {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .context("timed out")
}

/// 轮询直到条件成立
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {what}")
}

pub fn nodes(execution: &FlowExecution) -> anyhow::Result<Vec<FlowNode>> {
    Ok(execution.walker()?.collect())
}

pub fn atoms(execution: &FlowExecution) -> anyhow::Result<Vec<String>> {
    Ok(nodes(execution)?
        .into_iter()
        .filter_map(|node| match node.kind {
            FlowNodeKind::StepAtom { function } => Some(function),
            _ => None,
        })
        .collect())
}

/// 等待线程数达到 n 且程序稳定
pub async fn wait_threads(execution: &FlowExecution, n: usize) -> anyhow::Result<()> {
    within(async {
        loop {
            if execution.thread_dump().await?.len() == n {
                return execution.wait_for_suspension().await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await??;
    Ok(())
}

/// 结束节点上记录的失败信息
pub fn end_failure(execution: &FlowExecution) -> anyhow::Result<Option<String>> {
    for head in execution.current_heads()? {
        for action in execution.actions(&head.id)? {
            if let Some(failure) = action.as_error() {
                return Ok(Some(failure.to_string()));
            }
        }
    }
    Ok(None)
}

/// 复制执行目录，模拟在另一台机器上重新加载
pub fn copy_dir(from: &Path, to: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
