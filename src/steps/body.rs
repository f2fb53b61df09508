use tracing::debug;

use crate::error::{FlowError, Result};
use crate::flow::{FlowResult, NodeAction};
use crate::runtime::{FlowFailure, InterruptCause, Outcome};
use crate::state::ContextValue;

use super::context::{BodyLaunch, BodySource, StepContext};

/// 请求运行一个 body；只能启动一次
pub struct BodyInvoker {
    context: StepContext,
    source: BodySource,
    overrides: Vec<ContextValue>,
    label: Option<String>,
    start_actions: Vec<NodeAction>,
    started: bool,
}

impl BodyInvoker {
    pub(crate) fn new(context: StepContext, source: BodySource) -> Self {
        Self {
            context,
            source,
            overrides: Vec::new(),
            label: None,
            start_actions: Vec::new(),
            started: false,
        }
    }

    /// 注入到 body 上下文中的值
    pub fn with_context(mut self, value: ContextValue) -> Self {
        self.overrides.push(value);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// 附加在 body 起始节点上的动作
    pub fn with_start_action(mut self, action: NodeAction) -> Self {
        self.start_actions.push(action);
        self
    }

    pub fn start(&mut self) -> Result<BodyExecution> {
        if self.started {
            return Err(FlowError::BodyAlreadyStarted);
        }
        let launch = BodyLaunch {
            index: 0,
            source: self.source.clone(),
            overrides: self.overrides.clone(),
            label: self.label.clone(),
            start_actions: self.start_actions.clone(),
        };
        let body = self.context.submit_body(launch)?;
        self.started = true;
        debug!(step = %self.context.function(), index = body.index(), "Body requested");
        Ok(body)
    }
}

/// 已请求的 body 的句柄
#[derive(Clone, Debug)]
pub struct BodyExecution {
    context: StepContext,
    index: usize,
}

impl BodyExecution {
    pub(crate) fn new(context: StepContext, index: usize) -> Self {
        Self { context, index }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> Option<String> {
        self.context.body_state(self.index).and_then(|b| b.label)
    }

    pub fn is_done(&self) -> bool {
        self.outcome().is_some()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.context.body_state(self.index).and_then(|b| b.outcome)
    }

    /// 以 ABORTED 中断该 body；已结束时返回 false
    pub fn cancel(&self, causes: Vec<InterruptCause>) -> Result<bool> {
        self.stop(FlowFailure::interrupted(FlowResult::Aborted, causes))
    }

    /// 以给定失败中断该 body
    pub(crate) fn stop(&self, failure: FlowFailure) -> Result<bool> {
        let Some(thread) = self.context.body_stopped(self.index, failure.clone()) else {
            return Ok(false);
        };
        if let Some(thread) = thread {
            self.context
                .execution()
                .run_in_vm(move |group| group.cancel_body(thread, failure))?;
        }
        Ok(true)
    }
}
