// 命令行使用的执行操作
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::flow::{FlowResult, NodeAction};
use crate::runtime::{
    DirectoryOwner, Executable, ExecutionRecord, FlowDefinition, FlowEnvironment, FlowExecution,
    FlowExecutionOwner, Outcome, ThreadId, ThreadInfo, RECORD_FILE,
};
use crate::steps::InputStep;

/// 执行状态摘要
#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub url: String,
    pub result: FlowResult,
    pub complete: bool,
    pub heads: Vec<String>,
    pub threads: Vec<ThreadInfo>,
    pub pending_inputs: Vec<String>,
    pub console: Vec<String>,
}

/// 对已加载执行的后续操作
#[derive(Clone, Debug, PartialEq)]
pub enum ResumeAction {
    None,
    Thread { id: ThreadId, value: Value },
    Proceed { input: String, value: Value },
    Abort { input: String, user: Option<String> },
}

fn environment(config: &EngineConfig) -> FlowEnvironment {
    FlowEnvironment::default().with_storage(config.storage)
}

fn owner_for(dir: &Path, build: Option<Executable>) -> Arc<dyn FlowExecutionOwner> {
    match build {
        Some(build) => Arc::new(DirectoryOwner::for_build(dir, build.job, build.number)),
        None => Arc::new(DirectoryOwner::new(dir)),
    }
}

/// 只读取执行记录，不恢复程序
pub fn read_record(dir: &Path) -> Result<ExecutionRecord> {
    let bytes = std::fs::read(dir.join(RECORD_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// 运行脚本文件，等待挂起或完成
pub async fn run_script(
    script: &Path,
    dir: &Path,
    build: Option<Executable>,
    sandbox: bool,
    wait: bool,
    config: &EngineConfig,
) -> Result<StatusReport> {
    let source = std::fs::read_to_string(script)?;
    std::fs::create_dir_all(dir)?;
    let execution = FlowDefinition::new(source)
        .sandboxed(sandbox || config.sandbox)
        .create_execution(owner_for(dir, build), environment(config));
    execution.start().await?;
    settle(&execution, wait).await?;
    status_of(&execution).await
}

/// 重新加载执行并执行给定操作
pub async fn resume(
    dir: &Path,
    action: ResumeAction,
    wait: bool,
    config: &EngineConfig,
) -> Result<StatusReport> {
    let record = read_record(dir)?;
    let execution = FlowExecution::load(owner_for(dir, record.owner), environment(config)).await?;
    execution.wait_for_suspension().await?;
    let url = execution.url();
    if execution.is_complete() && action != ResumeAction::None {
        crate::log_warn!("Execution already completed, ignoring resume", execution = url.as_str());
        return status_of(&execution).await;
    }
    match action {
        ResumeAction::None => {}
        ResumeAction::Thread { id, value } => {
            execution.resume_thread(id, Outcome::success(value)).await?;
        }
        ResumeAction::Proceed { input, value } => InputStep::proceed(&url, &input, value)?,
        ResumeAction::Abort { input, user } => InputStep::abort(&url, &input, user)?,
    }
    settle(&execution, wait).await?;
    status_of(&execution).await
}

async fn settle(execution: &Arc<FlowExecution>, wait: bool) -> Result<()> {
    if wait {
        let result = execution.wait_for_completion().await?;
        info!(execution = %execution.url(), result = %result, "Flow completed");
    } else {
        execution.wait_for_suspension().await?;
    }
    Ok(())
}

/// 重新加载执行并报告状态
pub async fn status(dir: &Path, config: &EngineConfig) -> Result<StatusReport> {
    let record = read_record(dir)?;
    let execution = FlowExecution::load(owner_for(dir, record.owner), environment(config)).await?;
    execution.wait_for_suspension().await?;
    status_of(&execution).await
}

pub async fn status_of(execution: &Arc<FlowExecution>) -> Result<StatusReport> {
    let heads = execution
        .current_heads()?
        .into_iter()
        .map(|node| node.id)
        .collect();
    Ok(StatusReport {
        url: execution.url(),
        result: execution.result(),
        complete: execution.is_complete(),
        heads,
        threads: execution.thread_dump().await?,
        pending_inputs: InputStep::pending_ids(&execution.url()),
        console: execution.console(),
    })
}

/// 按遍历顺序列出流程图，每行一个节点
pub fn graph_lines(execution: &FlowExecution) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for node in execution.walker()? {
        let parents = node.parents.join(",");
        let mut line = format!("{} [{}] <- [{}]", node.id, node.display_name(), parents);
        for action in execution.actions(&node.id)? {
            let text = match action {
                NodeAction::Error { failure } => format!("error: {failure}"),
                NodeAction::BodyInvocation => "body".to_string(),
                NodeAction::Label { name } => format!("label: {name}"),
                NodeAction::Arguments { values } => format!("args: {values}"),
                NodeAction::Log { text } => format!("log: {text}"),
            };
            line.push_str("\n    ");
            line.push_str(&text);
        }
        lines.push(line);
    }
    Ok(lines)
}

/// 读取执行图，不等待程序恢复
pub async fn graph(dir: &Path, config: &EngineConfig) -> Result<Vec<String>> {
    let record = read_record(dir)?;
    let execution = FlowExecution::load(owner_for(dir, record.owner), environment(config)).await?;
    graph_lines(&execution)
}
