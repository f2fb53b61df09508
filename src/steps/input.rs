use std::collections::BTreeMap;
use std::sync::OnceLock;

use anyhow::anyhow;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{FlowError, Result};
use crate::flow::FlowResult;
use crate::runtime::{FlowExecution, FlowFailure, InterruptCause};

use super::{StepArgs, StepContext, StepDescriptor, StepExecution};

/// 等待外部回应的 input 步骤，按 (执行 url, id) 索引
fn pending() -> &'static Mutex<BTreeMap<(String, String), StepContext>> {
    static PENDING: OnceLock<Mutex<BTreeMap<(String, String), StepContext>>> = OnceLock::new();
    PENDING.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// input(id, message)：暂停直到有人批准或拒绝
pub struct InputStep;

impl InputStep {
    /// 某个执行中正在等待的 input id
    pub fn pending_ids(execution: &str) -> Vec<String> {
        pending()
            .lock()
            .keys()
            .filter(|(url, _)| url == execution)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// 批准并以 value 作为步骤结果
    pub fn proceed(execution: &str, id: &str, value: Value) -> Result<()> {
        let context = Self::take(execution, id)?;
        info!(execution, input = id, "Input approved");
        context.on_success(value)
    }

    /// 拒绝：步骤以 ABORTED 中断失败
    pub fn abort(execution: &str, id: &str, user: Option<String>) -> Result<()> {
        let context = Self::take(execution, id)?;
        info!(execution, input = id, "Input rejected");
        context.on_failure(FlowFailure::interrupted(
            FlowResult::Aborted,
            vec![InterruptCause::User { name: user }],
        ))
    }

    fn take(execution: &str, id: &str) -> Result<StepContext> {
        pending()
            .lock()
            .remove(&(execution.to_string(), id.to_string()))
            .ok_or_else(|| FlowError::Other(anyhow!("no pending input `{id}` in {execution}")))
    }
}

impl StepDescriptor for InputStep {
    fn function_name(&self) -> &str {
        "input"
    }

    fn new_execution(&self, args: StepArgs, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let id = args
            .string("id", 0)
            .unwrap_or_else(|| format!("input-{}", context.id()));
        let message = args.string("message", 1).unwrap_or_else(|| "Proceed?".to_string());
        Ok(Box::new(InputExecution {
            context,
            state: InputState { id, message },
        }))
    }

    fn restore(&self, state: Value, context: StepContext) -> Result<Box<dyn StepExecution>> {
        Ok(Box::new(InputExecution {
            context,
            state: serde_json::from_value(state)?,
        }))
    }

    fn on_flow_completed(&self, execution: &FlowExecution) {
        let url = execution.url();
        pending().lock().retain(|(owner, _), _| owner != &url);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct InputState {
    id: String,
    message: String,
}

struct InputExecution {
    context: StepContext,
    state: InputState,
}

impl InputExecution {
    fn key(&self) -> (String, String) {
        (self.context.execution().url(), self.state.id.clone())
    }

    fn register(&self) {
        pending().lock().insert(self.key(), self.context.clone());
    }
}

impl StepExecution for InputExecution {
    fn context(&self) -> &StepContext {
        &self.context
    }

    fn start(&mut self) -> Result<bool> {
        self.context.println(&self.state.message);
        self.context
            .println(format!("Waiting for input `{}`", self.state.id));
        self.register();
        Ok(false)
    }

    fn stop(&mut self, cause: FlowFailure) -> Result<()> {
        pending().lock().remove(&self.key());
        if !self.context.is_completed() {
            self.context.on_failure(cause)?;
        }
        Ok(())
    }

    fn save_state(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn on_resume(&mut self) {
        if !self.context.is_completed() {
            self.register();
        }
    }
}
