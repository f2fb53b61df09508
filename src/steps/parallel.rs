use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{FlowError, Result};
use crate::runtime::{FlowFailure, InterruptCause, Outcome};

use super::{BodyExecution, StepArgs, StepContext, StepDescriptor, StepExecution};

/// parallel(a: { ... }, b: { ... }, failFast: true)
pub struct ParallelStep;

impl StepDescriptor for ParallelStep {
    fn function_name(&self) -> &str {
        "parallel"
    }

    fn takes_block(&self) -> bool {
        true
    }

    fn new_execution(&self, args: StepArgs, context: StepContext) -> Result<Box<dyn StepExecution>> {
        let mut seen = BTreeSet::new();
        let mut branches = Vec::with_capacity(args.bodies.len());
        for name in &args.bodies {
            let name = name.clone().ok_or_else(|| {
                FlowError::invalid_args("parallel", "every branch needs a name")
            })?;
            if !seen.insert(name.clone()) {
                return Err(FlowError::invalid_args(
                    "parallel",
                    format!("duplicate branch name `{name}`"),
                ));
            }
            branches.push(name);
        }
        let slots = vec![None; branches.len()];
        Ok(Box::new(ParallelExecution {
            context,
            handler: ResultHandler {
                branches,
                slots,
                first_failure: None,
                stop_sent: false,
                fail_fast: args.bool("failFast", false),
            },
        }))
    }

    fn restore(&self, state: Value, context: StepContext) -> Result<Box<dyn StepExecution>> {
        Ok(Box::new(ParallelExecution {
            context,
            handler: serde_json::from_value(state)?,
        }))
    }
}

/// 分支结果的汇总，随步骤一起持久化
#[derive(Debug, Serialize, Deserialize)]
struct ResultHandler {
    branches: Vec<String>,
    slots: Vec<Option<Outcome>>,
    #[serde(default)]
    first_failure: Option<(String, FlowFailure)>,
    #[serde(default)]
    stop_sent: bool,
    #[serde(default)]
    fail_fast: bool,
}

impl ResultHandler {
    fn is_done(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index)
    }

    fn outcome(&self) -> Outcome {
        if let Some((branch, cause)) = &self.first_failure {
            return Outcome::failure(FlowFailure::Branch {
                branch: branch.clone(),
                cause: Box::new(cause.clone()),
            });
        }
        let values: Map<String, Value> = self
            .branches
            .iter()
            .zip(&self.slots)
            .map(|(name, slot)| {
                let value = slot
                    .as_ref()
                    .and_then(Outcome::normal)
                    .cloned()
                    .unwrap_or(Value::Null);
                (name.clone(), value)
            })
            .collect();
        Outcome::success(Value::Object(values))
    }
}

struct ParallelExecution {
    context: StepContext,
    handler: ResultHandler,
}

impl ParallelExecution {
    fn body(&self, index: usize) -> BodyExecution {
        BodyExecution::new(self.context.clone(), index)
    }

    fn finish_if_done(&mut self) -> Result<()> {
        if self.handler.is_done() && !self.context.is_completed() {
            self.context.complete(self.handler.outcome())?;
        }
        Ok(())
    }
}

impl StepExecution for ParallelExecution {
    fn context(&self) -> &StepContext {
        &self.context
    }

    fn start(&mut self) -> Result<bool> {
        if self.handler.branches.is_empty() {
            self.context.complete(self.handler.outcome())?;
            return Ok(true);
        }
        for (index, name) in self.handler.branches.iter().enumerate() {
            self.context
                .new_body_invoker(index)?
                .with_label(name.clone())
                .start()?;
        }
        Ok(false)
    }

    fn on_body_complete(&mut self, index: usize, outcome: Outcome) -> Result<()> {
        let Some(name) = self.handler.branches.get(index).cloned() else {
            return Ok(());
        };
        debug!(branch = %name, success = outcome.is_success(), "Parallel branch finished");
        if let Some(failure) = outcome.abnormal() {
            if self.handler.first_failure.is_none() {
                self.handler.first_failure = Some((name.clone(), failure.clone()));
            }
            if self.handler.fail_fast && !self.handler.stop_sent {
                self.handler.stop_sent = true;
                let others: Vec<usize> = self.handler.pending().filter(|i| *i != index).collect();
                for other in others {
                    let cause = InterruptCause::FailFast {
                        branch: name.clone(),
                    };
                    if let Err(err) = self.body(other).cancel(vec![cause]) {
                        warn!(branch = %self.handler.branches[other], error = %err, "Failed to cancel branch");
                    }
                }
            }
        }
        if let Some(slot) = self.handler.slots.get_mut(index) {
            *slot = Some(outcome);
        }
        self.finish_if_done()
    }

    /// 中断传给每个未结束的分支，全部结束后汇总
    fn stop(&mut self, cause: FlowFailure) -> Result<()> {
        let pending: Vec<usize> = self.handler.pending().collect();
        for index in pending {
            self.body(index).stop(cause.clone())?;
        }
        self.finish_if_done()
    }

    fn save_state(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.handler)?)
    }
}
