use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::flow::NodeId;
use crate::script::{Continuable, Program};
use crate::state::ContextVariableSet;
use crate::steps::{StepContext, StepExecution};

use super::Outcome;

pub type ThreadId = u32;
pub type HeadId = u32;

/// 线程结束时触发的回调，以数据形式持久化
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionHandler {
    /// 重新检查该线程当前步骤是否可以结束
    ScheduleNextRun { thread: ThreadId },
}

/// 正在执行的步骤
pub struct ActiveStep {
    pub context: StepContext,
    pub execution: Box<dyn StepExecution>,
}

/// 把 body 线程的结束回报给发起它的步骤
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BodyAdapter {
    pub owner: ThreadId,
    pub context: NodeId,
    pub index: usize,
    pub start: NodeId,
    pub forked: bool,
}

/// 线程组中的一条协作执行流
pub struct CpsThread {
    pub(crate) id: ThreadId,
    pub(crate) program: Program,
    pub(crate) resume_value: Option<Outcome>,
    pub(crate) promise: Option<oneshot::Sender<Outcome>>,
    pub(crate) head: HeadId,
    pub(crate) variables: ContextVariableSet,
    pub(crate) step: Option<ActiveStep>,
    pub(crate) completion_handlers: Vec<CompletionHandler>,
    pub(crate) body: Option<BodyAdapter>,
}

impl CpsThread {
    pub(crate) fn new(
        id: ThreadId,
        program: Program,
        head: HeadId,
        variables: ContextVariableSet,
    ) -> Self {
        Self {
            id,
            program,
            resume_value: None,
            promise: None,
            head,
            variables,
            step: None,
            completion_handlers: Vec::new(),
            body: None,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn head(&self) -> HeadId {
        self.head
    }

    pub fn is_runnable(&self) -> bool {
        self.resume_value.is_some()
    }

    pub fn is_alive(&self) -> bool {
        self.program.is_resumable()
    }

    pub fn variables(&self) -> &ContextVariableSet {
        &self.variables
    }

    pub(crate) fn add_completion_handler(&mut self, handler: CompletionHandler) {
        if !self.completion_handlers.contains(&handler) {
            self.completion_handlers.push(handler);
        }
    }
}

/// 线程转储中的一项
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub head: HeadId,
    pub node: Option<NodeId>,
    pub runnable: bool,
    pub step: Option<String>,
    pub owner: Option<ThreadId>,
}
