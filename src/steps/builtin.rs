use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{FlowError, Result};
use crate::runtime::{FlowFailure, Outcome};
use crate::state::{ContextValue, EnvVars, Pickle, ResourceHandle};

use super::{StepArgs, StepContext, StepDescriptor, StepExecution};

type SyncBody = Box<dyn FnOnce(&StepContext) -> std::result::Result<Value, FlowFailure> + Send>;

/// 在 start 中立即得出结果的步骤
struct SyncExecution {
    context: StepContext,
    body: Option<SyncBody>,
}

impl SyncExecution {
    fn boxed<F>(context: StepContext, body: F) -> Box<dyn StepExecution>
    where
        F: FnOnce(&StepContext) -> std::result::Result<Value, FlowFailure> + Send + 'static,
    {
        Box::new(Self {
            context,
            body: Some(Box::new(body)),
        })
    }
}

impl StepExecution for SyncExecution {
    fn context(&self) -> &StepContext {
        &self.context
    }

    fn start(&mut self) -> Result<bool> {
        let outcome = match self.body.take() {
            Some(body) => Outcome::from(body(&self.context)),
            None => Outcome::failure(FlowFailure::error("step was already started")),
        };
        self.context.complete(outcome)?;
        Ok(true)
    }
}

fn not_restorable(function: &str) -> FlowError {
    FlowError::ProgramNotLoaded(format!("synchronous step `{function}` has no persisted state"))
}

/// echo(message)
pub struct EchoStep;

impl StepDescriptor for EchoStep {
    fn function_name(&self) -> &str {
        "echo"
    }

    fn new_execution(&self, args: StepArgs, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let message = args.string("message", 0).unwrap_or_default();
        Ok(SyncExecution::boxed(context, move |context| {
            context.println(&message);
            Ok(Value::Null)
        }))
    }

    fn restore(&self, _state: Value, _context: StepContext) -> Result<Box<dyn StepExecution>> {
        Err(not_restorable(self.function_name()))
    }
}

/// error(message)
pub struct ErrorStep;

impl StepDescriptor for ErrorStep {
    fn function_name(&self) -> &str {
        "error"
    }

    fn new_execution(&self, args: StepArgs, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let message = args.string("message", 0).unwrap_or_default();
        Ok(SyncExecution::boxed(context, move |_| {
            Err(FlowFailure::error(message))
        }))
    }

    fn restore(&self, _state: Value, _context: StepContext) -> Result<Box<dyn StepExecution>> {
        Err(not_restorable(self.function_name()))
    }
}

/// getEnv(name)
pub struct GetEnvStep;

impl StepDescriptor for GetEnvStep {
    fn function_name(&self) -> &str {
        "getEnv"
    }

    fn new_execution(&self, args: StepArgs, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let name = args.require_string("name", 0)?;
        Ok(SyncExecution::boxed(context, move |context| {
            Ok(context
                .environment()
                .get(&name)
                .map(|value| Value::String(value.to_string()))
                .unwrap_or(Value::Null))
        }))
    }

    fn restore(&self, _state: Value, _context: StepContext) -> Result<Box<dyn StepExecution>> {
        Err(not_restorable(self.function_name()))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Serialize, Deserialize)]
struct SleepState {
    deadline: u64,
}

/// sleep(time, unit)
pub struct SleepStep;

impl StepDescriptor for SleepStep {
    fn function_name(&self) -> &str {
        "sleep"
    }

    fn new_execution(&self, args: StepArgs, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let time = args
            .u64("time", 0)?
            .ok_or_else(|| FlowError::invalid_args("sleep", "missing argument `time`"))?;
        let unit = args.string("unit", 1).unwrap_or_else(|| "SECONDS".to_string());
        let millis = match unit.as_str() {
            "MILLISECONDS" => time,
            "SECONDS" => time.saturating_mul(1_000),
            "MINUTES" => time.saturating_mul(60_000),
            other => {
                return Err(FlowError::invalid_args(
                    "sleep",
                    format!("unsupported unit `{other}`"),
                ))
            }
        };
        Ok(Box::new(SleepExecution {
            context,
            deadline: now_millis().saturating_add(millis),
            timer: None,
        }))
    }

    fn restore(&self, state: Value, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let state: SleepState = serde_json::from_value(state)?;
        Ok(Box::new(SleepExecution {
            context,
            deadline: state.deadline,
            timer: None,
        }))
    }
}

struct SleepExecution {
    context: StepContext,
    deadline: u64,
    timer: Option<JoinHandle<()>>,
}

impl SleepExecution {
    fn arm(&mut self) {
        let remaining = self.deadline.saturating_sub(now_millis());
        let context = self.context.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(remaining)).await;
            if !context.is_completed() {
                if let Err(err) = context.on_success(Value::Null) {
                    debug!(error = %err, "Sleep finished after the step completed");
                }
            }
        }));
    }
}

impl StepExecution for SleepExecution {
    fn context(&self) -> &StepContext {
        &self.context
    }

    fn start(&mut self) -> Result<bool> {
        if self.deadline <= now_millis() {
            self.context.on_success(Value::Null)?;
            return Ok(true);
        }
        self.arm();
        Ok(false)
    }

    fn stop(&mut self, cause: FlowFailure) -> Result<()> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if !self.context.is_completed() {
            self.context.on_failure(cause)?;
        }
        Ok(())
    }

    fn save_state(&self) -> Result<Value> {
        Ok(serde_json::to_value(SleepState {
            deadline: self.deadline,
        })?)
    }

    fn on_resume(&mut self) {
        if !self.context.is_completed() {
            self.arm();
        }
    }
}

/// 只启动一个 body，结果即 body 的结果
struct BodyOnlyExecution {
    context: StepContext,
    overrides: Vec<ContextValue>,
}

impl StepExecution for BodyOnlyExecution {
    fn context(&self) -> &StepContext {
        &self.context
    }

    fn start(&mut self) -> Result<bool> {
        let mut invoker = self.context.new_body_invoker(0)?;
        for value in self.overrides.drain(..) {
            invoker = invoker.with_context(value);
        }
        invoker.start()?;
        Ok(false)
    }
}

/// withEnv(["K=V"]) { ... }
pub struct WithEnvStep;

impl StepDescriptor for WithEnvStep {
    fn function_name(&self) -> &str {
        "withEnv"
    }

    fn takes_block(&self) -> bool {
        true
    }

    fn new_execution(&self, args: StepArgs, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let entries: Vec<String> = match args.value("overrides", 0) {
            Some(Value::Array(items)) => items.iter().map(crate::script::display).collect(),
            _ => {
                return Err(FlowError::invalid_args(
                    "withEnv",
                    "expected a list of KEY=VALUE strings",
                ))
            }
        };
        let vars = EnvVars::parse(entries.iter().map(String::as_str)).ok_or_else(|| {
            FlowError::invalid_args("withEnv", "every override must look like KEY=VALUE")
        })?;
        if context.body_count() == 0 {
            return Err(FlowError::invalid_args("withEnv", "a body is required"));
        }
        Ok(Box::new(BodyOnlyExecution {
            context,
            overrides: vec![ContextValue::env(vars)],
        }))
    }

    fn restore(&self, _state: Value, context: StepContext) -> Result<Box<dyn StepExecution>> {
        Ok(Box::new(BodyOnlyExecution {
            context,
            overrides: Vec::new(),
        }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RetryState {
    remaining: u64,
}

/// retry(count) { ... }
pub struct RetryStep;

impl StepDescriptor for RetryStep {
    fn function_name(&self) -> &str {
        "retry"
    }

    fn takes_block(&self) -> bool {
        true
    }

    fn new_execution(&self, args: StepArgs, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let count = args.u64("count", 0)?.unwrap_or(1).max(1);
        if context.body_count() == 0 {
            return Err(FlowError::invalid_args("retry", "a body is required"));
        }
        Ok(Box::new(RetryExecution {
            context,
            remaining: count,
        }))
    }

    fn restore(&self, state: Value, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let state: RetryState = serde_json::from_value(state)?;
        Ok(Box::new(RetryExecution {
            context,
            remaining: state.remaining,
        }))
    }
}

struct RetryExecution {
    context: StepContext,
    remaining: u64,
}

impl StepExecution for RetryExecution {
    fn context(&self) -> &StepContext {
        &self.context
    }

    fn start(&mut self) -> Result<bool> {
        self.context.new_body_invoker(0)?.start()?;
        Ok(false)
    }

    fn on_body_complete(&mut self, _index: usize, outcome: Outcome) -> Result<()> {
        if self.context.is_completed() {
            return Ok(());
        }
        match outcome {
            Outcome::Abnormal(failure) if !failure.is_interruption() && self.remaining > 1 => {
                self.remaining -= 1;
                self.context.println(format!("{failure}"));
                self.context.println("Retrying");
                self.context.new_body_invoker(0)?.start()?;
                Ok(())
            }
            other => self.context.complete(other),
        }
    }

    fn save_state(&self) -> Result<Value> {
        Ok(serde_json::to_value(RetryState {
            remaining: self.remaining,
        })?)
    }
}

/// load(path)：运行另一个脚本文件
pub struct LoadStep;

impl StepDescriptor for LoadStep {
    fn function_name(&self) -> &str {
        "load"
    }

    fn creates_block(&self) -> bool {
        true
    }

    fn requires_trust(&self) -> bool {
        true
    }

    fn new_execution(&self, args: StepArgs, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let path = PathBuf::from(args.require_string("path", 0)?);
        Ok(Box::new(LoadExecution { context, path }))
    }

    fn restore(&self, state: Value, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let path = state
            .get("path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_default();
        Ok(Box::new(LoadExecution { context, path }))
    }
}

struct LoadExecution {
    context: StepContext,
    path: PathBuf,
}

impl StepExecution for LoadExecution {
    fn context(&self) -> &StepContext {
        &self.context
    }

    fn start(&mut self) -> Result<bool> {
        let execution = self.context.execution();
        let path = if self.path.is_absolute() {
            self.path.clone()
        } else {
            execution.owner().root_dir().join(&self.path)
        };
        let source = std::fs::read_to_string(&path).map_err(|err| {
            FlowError::invalid_args("load", format!("cannot read {}: {err}", path.display()))
        })?;
        let name = execution.add_loaded_script(source);
        debug!(script = %name, path = %path.display(), "Loading script");
        self.context.new_script_invoker(name).start()?;
        Ok(false)
    }

    fn save_state(&self) -> Result<Value> {
        Ok(json!({ "path": self.path }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceState {
    pickle: Pickle,
}

/// withResource(kind, key) { ... }：恢复外部资源后在其上下文中运行 body
pub struct WithResourceStep;

impl StepDescriptor for WithResourceStep {
    fn function_name(&self) -> &str {
        "withResource"
    }

    fn takes_block(&self) -> bool {
        true
    }

    fn new_execution(&self, args: StepArgs, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let kind = args.require_string("kind", 0)?;
        let key = args.require_string("key", 1)?;
        if context.body_count() == 0 {
            return Err(FlowError::invalid_args("withResource", "a body is required"));
        }
        Ok(Box::new(WithResourceExecution {
            context,
            pickle: Pickle::new(kind, key),
        }))
    }

    fn restore(&self, state: Value, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let state: ResourceState = serde_json::from_value(state)?;
        Ok(Box::new(WithResourceExecution {
            context,
            pickle: state.pickle,
        }))
    }
}

struct WithResourceExecution {
    context: StepContext,
    pickle: Pickle,
}

impl WithResourceExecution {
    fn acquire(&self) {
        let context = self.context.clone();
        let pickle = self.pickle.clone();
        tokio::spawn(async move {
            let live = context.execution().pickles().rehydrate(&pickle).await;
            let started = live.and_then(|live| {
                let handle = ResourceHandle::new(pickle.clone(), live);
                let mut invoker = context
                    .new_body_invoker(0)?
                    .with_context(ContextValue::resource(handle));
                invoker.start().map(drop)
            });
            if let Err(err) = started {
                context.fail_quietly(err);
            }
        });
    }
}

impl StepExecution for WithResourceExecution {
    fn context(&self) -> &StepContext {
        &self.context
    }

    fn start(&mut self) -> Result<bool> {
        self.acquire();
        Ok(false)
    }

    fn save_state(&self) -> Result<Value> {
        Ok(serde_json::to_value(ResourceState {
            pickle: self.pickle.clone(),
        })?)
    }

    fn on_resume(&mut self) {
        if !self.context.is_completed() && self.context.body_states().is_empty() {
            self.acquire();
        }
    }
}
