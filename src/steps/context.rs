use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{FlowError, Result};
use crate::flow::{FlowNode, FlowResult, NodeAction, NodeId};
use crate::runtime::{FlowExecution, FlowFailure, Outcome, ThreadId};
use crate::state::{ContextValue, ContextVariable, ContextVariableSet, EnvVars};

use super::body::{BodyExecution, BodyInvoker};

/// 步骤调用时导出的代码块
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BodyRef {
    pub handle: u32,
    #[serde(default)]
    pub label: Option<String>,
}

/// 一次 body 调用的进度
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyState {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub thread: Option<ThreadId>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    /// 启动前就被取消时携带的失败
    #[serde(default)]
    pub stopped: Option<FlowFailure>,
}

#[derive(Clone, Debug)]
pub(crate) enum BodySource {
    Exported(u32),
    Script(String),
}

/// 等待 VM 启动的 body
pub(crate) struct BodyLaunch {
    pub index: usize,
    pub source: BodySource,
    pub overrides: Vec<ContextValue>,
    pub label: Option<String>,
    pub start_actions: Vec<NodeAction>,
}

/// 切换到异步模式时的状态
pub(crate) struct AsyncSwitch {
    pub completed: bool,
    pub queued: Vec<BodyLaunch>,
}

/// 上下文的持久化形式
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: NodeId,
    pub thread: ThreadId,
    pub function: String,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub bodies: Vec<BodyRef>,
    #[serde(default)]
    pub executions: Vec<BodyState>,
    #[serde(default)]
    pub joined: Vec<NodeId>,
}

struct ContextState {
    outcome: Option<Outcome>,
    sync_mode: bool,
    bodies: Vec<BodyRef>,
    queued: Vec<BodyLaunch>,
    executions: Vec<BodyState>,
    joined: Vec<NodeId>,
}

struct ContextInner {
    id: NodeId,
    thread: ThreadId,
    function: String,
    execution: Arc<FlowExecution>,
    variables: ContextVariableSet,
    state: Mutex<ContextState>,
}

/// 步骤与线程之间的桥
///
/// 初始为同步模式：结果只被记录，由调用方立即取回。
/// 切换到异步模式后，设置结果会调度线程恢复。结果只能设置一次。
#[derive(Clone)]
pub struct StepContext {
    inner: Arc<ContextInner>,
}

impl StepContext {
    pub(crate) fn new(
        execution: Arc<FlowExecution>,
        id: NodeId,
        thread: ThreadId,
        function: String,
        variables: ContextVariableSet,
        bodies: Vec<BodyRef>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id,
                thread,
                function,
                execution,
                variables,
                state: Mutex::new(ContextState {
                    outcome: None,
                    sync_mode: true,
                    bodies,
                    queued: Vec::new(),
                    executions: Vec::new(),
                    joined: Vec::new(),
                }),
            }),
        }
    }

    /// 从持久化形式恢复，恢复后总是异步模式
    pub(crate) fn restore(
        execution: Arc<FlowExecution>,
        record: ContextRecord,
        variables: ContextVariableSet,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: record.id,
                thread: record.thread,
                function: record.function,
                execution,
                variables,
                state: Mutex::new(ContextState {
                    outcome: record.outcome,
                    sync_mode: false,
                    bodies: record.bodies,
                    queued: Vec::new(),
                    executions: record.executions,
                    joined: record.joined,
                }),
            }),
        }
    }

    pub(crate) fn record(&self) -> ContextRecord {
        let state = self.inner.state.lock();
        ContextRecord {
            id: self.inner.id.clone(),
            thread: self.inner.thread,
            function: self.inner.function.clone(),
            outcome: state.outcome.clone(),
            bodies: state.bodies.clone(),
            executions: state.executions.clone(),
            joined: state.joined.clone(),
        }
    }

    /// 步骤节点 id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread
    }

    pub fn function(&self) -> &str {
        &self.inner.function
    }

    pub fn execution(&self) -> &Arc<FlowExecution> {
        &self.inner.execution
    }

    pub fn variables(&self) -> &ContextVariableSet {
        &self.inner.variables
    }

    pub fn get<T: ContextVariable>(&self) -> Option<T> {
        self.inner.variables.get::<T>()
    }

    /// 合并后的环境变量
    pub fn environment(&self) -> EnvVars {
        self.inner.variables.environment()
    }

    pub fn node(&self) -> Result<FlowNode> {
        self.inner.execution.node(&self.inner.id)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.execution.is_ready()
    }

    pub fn body_count(&self) -> usize {
        self.inner.state.lock().bodies.len()
    }

    pub fn body_label(&self, index: usize) -> Option<String> {
        self.inner
            .state
            .lock()
            .bodies
            .get(index)
            .and_then(|body| body.label.clone())
    }

    pub(crate) fn bodies(&self) -> Vec<BodyRef> {
        self.inner.state.lock().bodies.clone()
    }

    /// 为第 index 个代码块参数创建调用器
    pub fn new_body_invoker(&self, index: usize) -> Result<BodyInvoker> {
        let body = self
            .inner
            .state
            .lock()
            .bodies
            .get(index)
            .cloned()
            .ok_or_else(|| {
                FlowError::invalid_args(&self.inner.function, format!("no body at position {index}"))
            })?;
        Ok(BodyInvoker::new(self.clone(), BodySource::Exported(body.handle)))
    }

    /// 把整个已加载的脚本作为 body 运行
    pub fn new_script_invoker(&self, script: impl Into<String>) -> BodyInvoker {
        BodyInvoker::new(self.clone(), BodySource::Script(script.into()))
    }

    pub fn on_success(&self, value: Value) -> Result<()> {
        self.complete(Outcome::Normal(value))
    }

    pub fn on_failure(&self, failure: FlowFailure) -> Result<()> {
        self.complete(Outcome::Abnormal(failure))
    }

    /// 设置结果；异步模式下随即调度线程恢复
    pub fn complete(&self, outcome: Outcome) -> Result<()> {
        let asynchronous = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return Err(FlowError::OutcomeAlreadySet(self.inner.function.clone()));
            }
            state.outcome = Some(outcome);
            !state.sync_mode
        };
        if asynchronous {
            self.schedule_next_run();
        }
        Ok(())
    }

    /// 记录失败，忽略已经有结果的情况
    pub(crate) fn fail_quietly(&self, err: FlowError) {
        if let Err(again) = self.on_failure(err.into()) {
            debug!(step = %self.inner.function, error = %again, "Step already had an outcome");
        }
    }

    pub fn is_completed(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.state.lock().outcome.clone()
    }

    /// 输出到控制台，并作为日志动作记在步骤节点上
    pub fn println(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        self.inner.execution.println(line);
        if let Err(err) = self.inner.execution.add_action(
            &self.inner.id,
            NodeAction::Log {
                text: line.to_string(),
            },
        ) {
            warn!(node = %self.inner.id, error = %err, "Failed to record log action");
        }
    }

    /// 合并到执行结果
    pub fn set_result(&self, result: FlowResult) {
        self.inner.execution.set_result(result);
    }

    /// 切到异步模式，取回已有结果与排队的 body
    pub(crate) fn switch_to_async_mode(&self) -> AsyncSwitch {
        let mut state = self.inner.state.lock();
        state.sync_mode = false;
        AsyncSwitch {
            completed: state.outcome.is_some(),
            queued: std::mem::take(&mut state.queued),
        }
    }

    pub(crate) fn take_queued(&self) -> Vec<BodyLaunch> {
        std::mem::take(&mut self.inner.state.lock().queued)
    }

    /// 登记一个新的 body；同步模式下排队，异步模式下交给 VM
    pub(crate) fn submit_body(&self, mut launch: BodyLaunch) -> Result<BodyExecution> {
        let (index, launch_now) = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return Err(FlowError::BodyAfterCompletion(self.inner.function.clone()));
            }
            let index = state.executions.len();
            launch.index = index;
            state.executions.push(BodyState {
                label: launch.label.clone(),
                ..BodyState::default()
            });
            if state.sync_mode {
                state.queued.push(launch);
                (index, None)
            } else {
                (index, Some(launch))
            }
        };
        if let Some(launch) = launch_now {
            let context = self.clone();
            self.inner
                .execution
                .run_in_vm(move |group| group.launch_async(&context, launch))?;
        }
        Ok(BodyExecution::new(self.clone(), index))
    }

    pub(crate) fn body_state(&self, index: usize) -> Option<BodyState> {
        self.inner.state.lock().executions.get(index).cloned()
    }

    pub fn body_states(&self) -> Vec<BodyState> {
        self.inner.state.lock().executions.clone()
    }

    /// body 线程已创建；返回启动前登记的取消原因
    pub(crate) fn body_started(&self, index: usize, thread: ThreadId) -> Option<FlowFailure> {
        let mut state = self.inner.state.lock();
        let body = state.executions.get_mut(index)?;
        body.thread = Some(thread);
        body.stopped.clone()
    }

    pub(crate) fn body_finished(&self, index: usize, outcome: Outcome) {
        let mut state = self.inner.state.lock();
        if let Some(body) = state.executions.get_mut(index) {
            body.outcome = Some(outcome);
            body.thread = None;
        }
    }

    /// 登记取消；返回仍在运行的 body 线程
    pub(crate) fn body_stopped(&self, index: usize, failure: FlowFailure) -> Option<Option<ThreadId>> {
        let mut state = self.inner.state.lock();
        let body = state.executions.get_mut(index)?;
        if body.outcome.is_some() {
            return None;
        }
        body.stopped = Some(failure);
        Some(body.thread)
    }

    pub(crate) fn join(&self, end: NodeId) {
        self.inner.state.lock().joined.push(end);
    }

    pub(crate) fn joined(&self) -> Vec<NodeId> {
        self.inner.state.lock().joined.clone()
    }

    /// 请求 VM 检查本步骤能否结束并恢复线程
    pub(crate) fn schedule_next_run(&self) {
        let context = self.clone();
        if let Err(err) = self
            .inner
            .execution
            .run_in_vm(move |group| group.complete_step(&context))
        {
            warn!(step = %self.inner.function, error = %err, "Cannot schedule step completion");
        }
    }
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("id", &self.inner.id)
            .field("thread", &self.inner.thread)
            .field("function", &self.inner.function)
            .finish()
    }
}
