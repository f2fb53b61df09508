use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{FlowError, Result};
use crate::script::{Closure, Program, ScriptSet};
use crate::state::{ContextValue, ContextVariableSet, LiveResource, Pickle};
use crate::steps::{ContextRecord, StepContext};

use super::execution::FlowExecution;
use super::group::ThreadGroup;
use super::thread::{ActiveStep, BodyAdapter, CompletionHandler, CpsThread, HeadId, ThreadId};
use super::vm::ProgramHandle;
use super::Outcome;

/// 程序状态文件
pub const PROGRAM_FILE: &str = "program.json";
/// 执行记录文件
pub const RECORD_FILE: &str = "flow.json";

const FORMAT_VERSION: u32 = 1;

/// 线程组的持久化形式，只在所有线程都不可运行时写出
#[derive(Debug, Serialize, Deserialize)]
pub struct ProgramState {
    pub version: u32,
    /// 需要先恢复的外部资源
    #[serde(default)]
    pub pickles: BTreeSet<Pickle>,
    pub iota: u32,
    #[serde(default)]
    pub closure_iota: u32,
    #[serde(default)]
    pub closures: BTreeMap<u32, Closure>,
    pub threads: Vec<ThreadState>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThreadState {
    pub id: ThreadId,
    pub program: Program,
    #[serde(default)]
    pub resume_value: Option<Outcome>,
    pub head: HeadId,
    #[serde(default)]
    pub variables: Vec<Vec<ContextValue>>,
    #[serde(default)]
    pub step: Option<StepState>,
    #[serde(default)]
    pub completion_handlers: Vec<CompletionHandler>,
    #[serde(default)]
    pub body: Option<BodyAdapter>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StepState {
    pub context: ContextRecord,
    #[serde(default)]
    pub state: Value,
}

/// 恢复线程组时显式传入的上下文
pub struct RestoreContext {
    pub resources: HashMap<Pickle, LiveResource>,
}

pub(crate) fn snapshot(group: &ThreadGroup) -> Result<ProgramState> {
    let mut pickles = BTreeSet::new();
    let mut threads = Vec::with_capacity(group.threads.len());
    for thread in group.threads.values() {
        pickles.extend(thread.variables.pickles());
        let step = match &thread.step {
            Some(step) => Some(StepState {
                context: step.context.record(),
                state: step.execution.save_state()?,
            }),
            None => None,
        };
        threads.push(ThreadState {
            id: thread.id,
            program: thread.program.clone(),
            resume_value: thread.resume_value.clone(),
            head: thread.head,
            variables: thread.variables.to_layers(),
            step,
            completion_handlers: thread.completion_handlers.clone(),
            body: thread.body.clone(),
        });
    }
    Ok(ProgramState {
        version: FORMAT_VERSION,
        pickles,
        iota: group.iota,
        closure_iota: group.closure_iota,
        closures: group.closures.clone(),
        threads,
    })
}

/// 两阶段加载：先恢复外部资源，再重建线程组
pub(crate) async fn load_group(execution: &Arc<FlowExecution>) -> Result<ThreadGroup> {
    let path = execution.program_file();
    let bytes = tokio::fs::read(&path).await.map_err(|err| {
        FlowError::ProgramNotLoaded(format!("cannot read {}: {err}", path.display()))
    })?;
    let state: ProgramState = serde_json::from_slice(&bytes)?;
    if state.version != FORMAT_VERSION {
        return Err(FlowError::ProgramNotLoaded(format!(
            "unsupported program state version {}",
            state.version
        )));
    }
    debug!(pickles = state.pickles.len(), "Rehydrating pickles");
    let resources = execution.pickles().rehydrate_all(&state.pickles).await?;
    let group = restore_group(execution.clone(), state, RestoreContext { resources })?;
    info!(execution = %execution.url(), threads = group.thread_count(), "Loaded program state");
    Ok(group)
}

fn compile(execution: &FlowExecution, scripts: &mut ScriptSet, name: &str) -> Result<()> {
    if scripts.get(name).is_none() {
        let source = execution.script_source(name)?;
        scripts.compile(name, &source)?;
    }
    Ok(())
}

pub(crate) fn restore_group(
    execution: Arc<FlowExecution>,
    state: ProgramState,
    context: RestoreContext,
) -> Result<ThreadGroup> {
    let (handle, inbox) = ProgramHandle::new();
    let mut scripts = ScriptSet::new();
    for closure in state.closures.values() {
        compile(&execution, &mut scripts, &closure.script)?;
    }

    let mut threads = BTreeMap::new();
    for saved in state.threads {
        let mut program = saved.program;
        if let Some(name) = program.script_name().map(str::to_string) {
            compile(&execution, &mut scripts, &name)?;
        }
        program.attach(&scripts)?;
        let variables = ContextVariableSet::from_layers(saved.variables, &context.resources);
        let mut thread = CpsThread::new(saved.id, program, saved.head, variables.clone());
        thread.resume_value = saved.resume_value;
        thread.completion_handlers = saved.completion_handlers;
        thread.body = saved.body;
        if let Some(step) = saved.step {
            let function = step.context.function.clone();
            let descriptor = execution
                .steps()
                .get(&function)
                .ok_or_else(|| FlowError::UnknownStep(function.clone()))?;
            let step_context = StepContext::restore(execution.clone(), step.context, variables);
            let restored = descriptor.restore(step.state, step_context.clone())?;
            thread.step = Some(ActiveStep {
                context: step_context,
                execution: restored,
            });
        }
        threads.insert(saved.id, thread);
    }

    Ok(ThreadGroup::from_parts(
        execution,
        handle,
        inbox,
        scripts,
        threads,
        state.closures,
        state.iota,
        state.closure_iota,
    ))
}
