// 步骤接口、注册表与内置步骤
mod body;
mod builtin;
mod context;
mod input;
mod parallel;
mod stage;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::error::{FlowError, Result};
use crate::runtime::{FlowExecution, FlowFailure};
use crate::script::{display, StepCall};

pub use body::{BodyExecution, BodyInvoker};
pub use builtin::{
    EchoStep, ErrorStep, GetEnvStep, LoadStep, RetryStep, SleepStep, WithEnvStep,
    WithResourceStep,
};
pub use context::{BodyRef, BodyState, ContextRecord, StepContext};
pub(crate) use context::{AsyncSwitch, BodyLaunch, BodySource};
pub use input::InputStep;
pub use parallel::ParallelStep;
pub use stage::{StageRegistry, StageStep};

/// 步骤类型：描述函数名与能力，并创建执行实例
pub trait StepDescriptor: Send + Sync {
    fn function_name(&self) -> &str;

    /// 是否接受代码块参数
    fn takes_block(&self) -> bool {
        false
    }

    /// 没有代码块时是否仍然生成块节点
    fn creates_block(&self) -> bool {
        self.takes_block()
    }

    /// 沙箱中是否禁止使用
    fn requires_trust(&self) -> bool {
        false
    }

    fn new_execution(&self, args: StepArgs, context: StepContext)
        -> Result<Box<dyn StepExecution>>;

    /// 从持久化状态重建执行实例
    fn restore(&self, state: Value, context: StepContext) -> Result<Box<dyn StepExecution>>;

    fn on_flow_completed(&self, _execution: &FlowExecution) {}
}

/// 一次步骤调用的执行实例
pub trait StepExecution: Send {
    fn context(&self) -> &StepContext;

    /// 返回 true 表示已同步完成，结果已写入上下文
    fn start(&mut self) -> Result<bool>;

    fn stop(&mut self, cause: FlowFailure) -> Result<()> {
        let context = self.context();
        if !context.is_completed() {
            context.on_failure(cause)?;
        }
        Ok(())
    }

    fn on_body_complete(&mut self, _index: usize, outcome: crate::runtime::Outcome) -> Result<()> {
        let context = self.context();
        if context.is_completed() {
            return Ok(());
        }
        context.complete(outcome)
    }

    fn save_state(&self) -> Result<Value> {
        Ok(Value::Null)
    }

    fn on_resume(&mut self) {}
}

/// 步骤调用参数
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepArgs {
    pub function: String,
    pub positional: Vec<Value>,
    pub named: BTreeMap<String, Value>,
    /// 代码块参数的名字，按位置排列
    pub bodies: Vec<Option<String>>,
}

impl StepArgs {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            ..Self::default()
        }
    }

    pub fn with_arg(mut self, value: Value) -> Self {
        self.positional.push(value);
        self
    }

    pub fn with_named(mut self, name: impl Into<String>, value: Value) -> Self {
        self.named.insert(name.into(), value);
        self
    }

    pub(crate) fn from_call(call: &StepCall) -> Self {
        let mut args = Self::new(call.function.clone());
        for (name, value) in &call.args {
            match name {
                Some(name) => {
                    args.named.insert(name.clone(), value.clone());
                }
                None => args.positional.push(value.clone()),
            }
        }
        args.bodies = call.bodies.iter().map(|(name, _)| name.clone()).collect();
        args
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    /// 先按名字查找，再按位置
    pub fn value(&self, name: &str, position: usize) -> Option<&Value> {
        self.named.get(name).or_else(|| self.positional.get(position))
    }

    pub fn string(&self, name: &str, position: usize) -> Option<String> {
        self.value(name, position).map(display)
    }

    pub fn require_string(&self, name: &str, position: usize) -> Result<String> {
        self.string(name, position).ok_or_else(|| {
            FlowError::invalid_args(&self.function, format!("missing argument `{name}`"))
        })
    }

    pub fn u64(&self, name: &str, position: usize) -> Result<Option<u64>> {
        match self.value(name, position) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
                FlowError::invalid_args(&self.function, format!("`{name}` must be a non-negative integer"))
            }),
            Some(Value::String(s)) => s.parse().map(Some).map_err(|_| {
                FlowError::invalid_args(&self.function, format!("`{name}` must be a non-negative integer"))
            }),
            Some(other) => Err(FlowError::invalid_args(
                &self.function,
                format!("`{name}` must be a non-negative integer, got {other}"),
            )),
        }
    }

    pub fn bool(&self, name: &str, default: bool) -> bool {
        match self.named.get(name) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => default,
        }
    }

    /// 记录在节点上的参数形式
    pub fn to_value(&self) -> Value {
        let named: Map<String, Value> = self
            .named
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        json!({ "positional": self.positional, "named": named })
    }
}

/// 函数名到步骤类型的映射
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn StepDescriptor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册全部内置步骤
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(EchoStep))
            .register(Arc::new(ErrorStep))
            .register(Arc::new(GetEnvStep))
            .register(Arc::new(SleepStep))
            .register(Arc::new(InputStep))
            .register(Arc::new(WithEnvStep))
            .register(Arc::new(RetryStep))
            .register(Arc::new(ParallelStep))
            .register(Arc::new(StageStep::new(StageRegistry::global())))
            .register(Arc::new(LoadStep))
            .register(Arc::new(WithResourceStep));
        registry
    }

    pub fn register(&mut self, step: Arc<dyn StepDescriptor>) -> &mut Self {
        self.steps.insert(step.function_name().to_string(), step);
        self
    }

    pub fn with_step(mut self, step: Arc<dyn StepDescriptor>) -> Self {
        self.register(step);
        self
    }

    pub fn get(&self, function: &str) -> Option<Arc<dyn StepDescriptor>> {
        self.steps.get(function).cloned()
    }

    pub fn descriptors(&self) -> Vec<Arc<dyn StepDescriptor>> {
        self.steps.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_arguments_win_over_positions() {
        let args = StepArgs::new("sleep")
            .with_arg(json!(5))
            .with_named("unit", json!("MILLISECONDS"));
        assert_eq!(args.u64("time", 0).unwrap(), Some(5));
        assert_eq!(args.string("unit", 1).as_deref(), Some("MILLISECONDS"));
        assert!(args.require_string("message", 3).is_err());
        assert!(!args.bool("failFast", false));
    }

    #[test]
    fn builtins_are_registered() {
        let registry = StepRegistry::with_builtins();
        for name in ["echo", "parallel", "stage", "withResource", "input", "load"] {
            assert!(registry.get(name).is_some(), "{name} missing");
        }
        assert!(registry.get("load").unwrap().requires_trust());
    }
}
