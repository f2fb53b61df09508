use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::flow::{FlowResult, NodeAction};
use crate::runtime::{Executable, FlowExecution, FlowFailure, InterruptCause};

use super::{StepArgs, StepContext, StepDescriptor, StepExecution};

struct Waiter {
    number: u64,
    context: StepContext,
}

#[derive(Default)]
struct Stage {
    holding: BTreeSet<u64>,
    concurrency: Option<usize>,
    waiting: Option<Waiter>,
}

impl Stage {
    fn has_room(&self) -> bool {
        self.concurrency
            .map_or(true, |limit| self.holding.len() < limit)
    }
}

/// 进入阶段后要在锁外完成的动作
#[derive(Default)]
struct Effects {
    proceed: Vec<StepContext>,
    supersede: Vec<(StepContext, String)>,
}

impl Effects {
    fn apply(self) {
        for context in self.proceed {
            if let Err(err) = context.on_success(Value::Null) {
                debug!(error = %err, "Stage waiter already completed");
            }
        }
        for (context, by) in self.supersede {
            let execution = context.execution().clone();
            info!(execution = %execution.url(), by = %by, "Build superseded in stage");
            tokio::spawn(async move {
                let causes = vec![InterruptCause::Superseded { by }];
                if let Err(err) = execution.interrupt(FlowResult::NotBuilt, causes).await {
                    warn!(execution = %execution.url(), error = %err, "Failed to interrupt superseded build");
                }
            });
        }
    }
}

/// 按作业分组的阶段占用表
///
/// 每个阶段最多 concurrency 个构建同时持有，至多一个构建排队；
/// 更新的构建到来时，排队中的旧构建被 NOT_BUILT 中断。
#[derive(Default)]
pub struct StageRegistry {
    stages: Mutex<BTreeMap<(String, String), Stage>>,
}

impl StageRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 进程内共享的实例
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<StageRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(StageRegistry::new).clone()
    }

    pub fn holders(&self, job: &str, stage: &str) -> Vec<u64> {
        self.stages
            .lock()
            .get(&(job.to_string(), stage.to_string()))
            .map(|s| s.holding.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn waiting(&self, job: &str, stage: &str) -> Option<u64> {
        self.stages
            .lock()
            .get(&(job.to_string(), stage.to_string()))
            .and_then(|s| s.waiting.as_ref().map(|w| w.number))
    }

    /// 返回 true 表示可以立即通过
    fn enter(
        &self,
        build: &Executable,
        name: &str,
        concurrency: Option<usize>,
        context: &StepContext,
    ) -> bool {
        let mut effects = Effects::default();
        let admitted = {
            let mut stages = self.stages.lock();
            Self::leave_others(&mut stages, build, name, &mut effects);
            let stage = stages
                .entry((build.job.clone(), name.to_string()))
                .or_default();
            if concurrency.is_some() {
                stage.concurrency = concurrency;
            }
            if stage.holding.contains(&build.number) {
                true
            } else {
                match stage.waiting.take() {
                    Some(waiter) if waiter.number > build.number => {
                        let by = Executable::new(build.job.clone(), waiter.number).to_string();
                        stage.waiting = Some(waiter);
                        effects.supersede.push((context.clone(), by));
                        false
                    }
                    Some(waiter) if waiter.number != build.number => {
                        effects.supersede.push((waiter.context, build.to_string()));
                        Self::admit_or_wait(stage, build.number, context)
                    }
                    _ => Self::admit_or_wait(stage, build.number, context),
                }
            }
        };
        effects.apply();
        admitted
    }

    fn admit_or_wait(stage: &mut Stage, number: u64, context: &StepContext) -> bool {
        if stage.has_room() {
            stage.holding.insert(number);
            true
        } else {
            stage.waiting = Some(Waiter {
                number,
                context: context.clone(),
            });
            false
        }
    }

    /// 离开同一作业的其他阶段，可能放行那里的排队者
    fn leave_others(
        stages: &mut BTreeMap<(String, String), Stage>,
        build: &Executable,
        current: &str,
        effects: &mut Effects,
    ) {
        for ((job, name), stage) in stages.iter_mut() {
            if job != &build.job || name == current {
                continue;
            }
            if stage.holding.remove(&build.number) {
                Self::wake(stage, effects);
            }
        }
    }

    fn wake(stage: &mut Stage, effects: &mut Effects) {
        if stage.has_room() {
            if let Some(waiter) = stage.waiting.take() {
                stage.holding.insert(waiter.number);
                effects.proceed.push(waiter.context);
            }
        }
    }

    /// 构建结束：离开该作业的全部阶段
    pub fn exit_all(&self, build: &Executable) {
        let mut effects = Effects::default();
        {
            let mut stages = self.stages.lock();
            for ((job, _), stage) in stages.iter_mut() {
                if job != &build.job {
                    continue;
                }
                if stage
                    .waiting
                    .as_ref()
                    .is_some_and(|w| w.number == build.number)
                {
                    stage.waiting = None;
                }
                if stage.holding.remove(&build.number) {
                    Self::wake(stage, &mut effects);
                }
            }
        }
        effects.apply();
    }

    fn cancel_waiter(&self, build: &Executable, name: &str) {
        let mut stages = self.stages.lock();
        if let Some(stage) = stages.get_mut(&(build.job.clone(), name.to_string())) {
            if stage
                .waiting
                .as_ref()
                .is_some_and(|w| w.number == build.number)
            {
                stage.waiting = None;
            }
        }
    }
}

/// stage(name, concurrency: n)
pub struct StageStep {
    registry: Arc<StageRegistry>,
}

impl StageStep {
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self { registry }
    }
}

impl StepDescriptor for StageStep {
    fn function_name(&self) -> &str {
        "stage"
    }

    fn new_execution(&self, args: StepArgs, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let name = args.require_string("name", 0)?;
        let concurrency = args.u64("concurrency", 1)?.map(|n| n as usize);
        Ok(Box::new(StageExecution {
            context,
            registry: self.registry.clone(),
            state: StageState { name, concurrency },
        }))
    }

    fn restore(&self, state: Value, context: StepContext) -> Result<Box<dyn StepExecution>> {
        Ok(Box::new(StageExecution {
            context,
            registry: self.registry.clone(),
            state: serde_json::from_value(state)?,
        }))
    }

    fn on_flow_completed(&self, execution: &FlowExecution) {
        if let Some(build) = execution.owner().executable() {
            self.registry.exit_all(&build);
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StageState {
    name: String,
    #[serde(default)]
    concurrency: Option<usize>,
}

struct StageExecution {
    context: StepContext,
    registry: Arc<StageRegistry>,
    state: StageState,
}

impl StageExecution {
    fn try_enter(&self) -> Result<bool> {
        let Some(build) = self.context.execution().owner().executable() else {
            self.context.on_success(Value::Null)?;
            return Ok(true);
        };
        if self
            .registry
            .enter(&build, &self.state.name, self.state.concurrency, &self.context)
        {
            self.context.on_success(Value::Null)?;
            return Ok(true);
        }
        if !self.context.is_completed() {
            self.context
                .println(format!("Waiting for builds to leave stage {}", self.state.name));
        }
        Ok(false)
    }
}

impl StepExecution for StageExecution {
    fn context(&self) -> &StepContext {
        &self.context
    }

    fn start(&mut self) -> Result<bool> {
        self.context.execution().add_action(
            self.context.id(),
            NodeAction::Label {
                name: self.state.name.clone(),
            },
        )?;
        self.context.println(format!("Entering stage {}", self.state.name));
        self.try_enter()
    }

    fn stop(&mut self, cause: FlowFailure) -> Result<()> {
        if let Some(build) = self.context.execution().owner().executable() {
            self.registry.cancel_waiter(&build, &self.state.name);
        }
        if !self.context.is_completed() {
            self.context.on_failure(cause)?;
        }
        Ok(())
    }

    fn save_state(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn on_resume(&mut self) {
        if self.context.is_completed() {
            return;
        }
        if let Err(err) = self.try_enter() {
            warn!(stage = %self.state.name, error = %err, "Failed to re-enter stage");
        }
    }
}
