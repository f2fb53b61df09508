use tracing::{debug, warn};

use crate::error::{FlowError, Result};
use crate::flow::{FlowNodeKind, NodeAction};
use crate::script::{Closure, Interpreter, Program, StepCall};
use crate::state::ContextVariableSet;
use crate::steps::{BodyLaunch, BodyRef, BodySource, StepArgs, StepContext};

use super::group::ThreadGroup;
use super::thread::{ActiveStep, BodyAdapter, CompletionHandler, CpsThread, HeadId, ThreadId};
use super::{FlowFailure, Outcome};

/// 线程在安全点请求执行的任务
#[derive(Debug)]
pub enum ThreadTask {
    InvokeStep(StepCall),
    /// 无步骤的挂起，由外部 resume 唤醒
    Pause,
}

/// 任务执行后线程的去向
pub(crate) enum TaskResult {
    /// 立即用该值继续运行
    Resume(Outcome),
    /// 挂起，把该值交给调度器
    Suspend(Outcome),
}

fn failed(message: String) -> TaskResult {
    TaskResult::Resume(Outcome::failure(FlowFailure::error(message)))
}

impl ThreadGroup {
    pub(crate) fn eval_task(&mut self, id: ThreadId, task: ThreadTask) -> TaskResult {
        match task {
            ThreadTask::Pause => {
                debug!(thread = id, "Thread paused");
                TaskResult::Suspend(Outcome::null())
            }
            ThreadTask::InvokeStep(call) => {
                let function = call.function.clone();
                match self.invoke_step(id, call) {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(thread = id, step = %function, error = %err, "Step invocation failed");
                        TaskResult::Resume(Outcome::failure(err.into()))
                    }
                }
            }
        }
    }

    fn invoke_step(&mut self, id: ThreadId, call: StepCall) -> Result<TaskResult> {
        let execution = self.execution.clone();
        let Some(descriptor) = execution.steps().get(&call.function) else {
            return Ok(failed(format!(
                "No such DSL method `{}` found (line {})",
                call.function, call.line
            )));
        };
        if execution.is_sandboxed() && descriptor.requires_trust() {
            return Ok(failed(format!(
                "Scripts not permitted to use step `{}` in a sandbox",
                call.function
            )));
        }
        if !call.bodies.is_empty() && !descriptor.takes_block() {
            return Ok(failed(format!("Step `{}` does not take a body", call.function)));
        }

        let (head, variables) = {
            let thread = self.thread_mut(id)?;
            (thread.head, thread.variables.clone())
        };
        let parent = execution.head_node_id(head)?;
        let kind = if call.bodies.is_empty() && !descriptor.creates_block() {
            FlowNodeKind::StepAtom {
                function: call.function.clone(),
            }
        } else {
            FlowNodeKind::StepStart {
                function: call.function.clone(),
            }
        };
        let node = execution.create_node(kind, vec![parent]);
        let node_id = node.id.clone();
        execution.set_new_head(head, node)?;

        let args = StepArgs::from_call(&call);
        if !args.is_empty() {
            execution.add_action(
                &node_id,
                NodeAction::Arguments {
                    values: args.to_value(),
                },
            )?;
        }
        let bodies: Vec<BodyRef> = call
            .bodies
            .into_iter()
            .map(|(label, closure)| BodyRef {
                handle: self.export(closure),
                label,
            })
            .collect();
        let context = StepContext::new(
            execution.clone(),
            node_id,
            id,
            call.function.clone(),
            variables,
            bodies,
        );
        debug!(thread = id, step = %call.function, node = %context.id(), "Starting step");

        let synchronous = match descriptor.new_execution(args, context.clone()) {
            Ok(step) => {
                let thread = self.thread_mut(id)?;
                let active = thread.step.insert(ActiveStep {
                    context: context.clone(),
                    execution: step,
                });
                match active.execution.start() {
                    Ok(synchronous) => synchronous,
                    Err(err) => {
                        context.fail_quietly(err);
                        true
                    }
                }
            }
            Err(err) => {
                context.fail_quietly(err);
                true
            }
        };

        if synchronous {
            let queued = context.take_queued();
            let outcome = match context.outcome() {
                Some(outcome) if queued.is_empty() => outcome,
                Some(_) => Outcome::failure(FlowFailure::error(format!(
                    "Step {} claimed to have ended synchronously, but started a body",
                    call.function
                ))),
                None => Outcome::failure(FlowFailure::error(format!(
                    "Step {} claimed to have ended synchronously, but didn't set the result",
                    call.function
                ))),
            };
            self.close_step(id, &context, &outcome)?;
            return Ok(TaskResult::Resume(outcome));
        }

        loop {
            let queued = context.take_queued();
            if queued.is_empty() {
                break;
            }
            self.launch_batch(&context, queued);
        }
        let switch = context.switch_to_async_mode();
        if !switch.queued.is_empty() {
            self.launch_batch(&context, switch.queued);
        }
        if !switch.completed {
            return Ok(TaskResult::Suspend(Outcome::null()));
        }
        if let Some(inner) = self.next_inner(id) {
            self.thread_mut(inner)?
                .add_completion_handler(CompletionHandler::ScheduleNextRun { thread: id });
            return Ok(TaskResult::Suspend(Outcome::null()));
        }
        let outcome = context.outcome().unwrap_or_else(Outcome::null);
        self.close_step(id, &context, &outcome)?;
        Ok(TaskResult::Resume(outcome))
    }

    /// 结束步骤：清除当前步骤，为块步骤补上结束节点，失败时标记节点
    fn close_step(&mut self, id: ThreadId, context: &StepContext, outcome: &Outcome) -> Result<()> {
        let thread = self.thread_mut(id)?;
        if thread
            .step
            .as_ref()
            .is_some_and(|step| step.context.id() == context.id())
        {
            thread.step = None;
        }
        let head = thread.head;
        self.unexport_bodies(context);

        let execution = self.execution.clone();
        let node = execution.node(context.id())?;
        if node.is_block_start() {
            let mut parents = vec![execution.head_node_id(head)?];
            parents.extend(context.joined());
            let end = execution.create_node(
                FlowNodeKind::StepEnd {
                    function: context.function().to_string(),
                    start_id: context.id().to_string(),
                },
                parents,
            );
            execution.set_new_head(head, end)?;
        }
        execution.mark_if_fail(head, outcome)?;
        debug!(thread = id, step = %context.function(), success = outcome.is_success(), "Step completed");
        Ok(())
    }

    pub(crate) fn unexport_bodies(&mut self, context: &StepContext) {
        for body in context.bodies() {
            self.unexport(body.handle);
        }
    }

    /// 异步模式下步骤结果到达后的处理
    pub(crate) fn complete_step(&mut self, context: &StepContext) {
        let id = context.thread_id();
        let current = self
            .threads
            .get(&id)
            .and_then(|thread| thread.step.as_ref())
            .is_some_and(|step| step.context.id() == context.id());
        if !current {
            debug!(thread = id, step = %context.function(), "Ignoring completion of a step that is no longer current");
            return;
        }
        self.unexport_bodies(context);

        if let Some(inner) = self.next_inner(id) {
            let failure = context.outcome().and_then(|o| o.abnormal().cloned());
            if let Some(thread) = self.threads.get_mut(&inner) {
                thread.add_completion_handler(CompletionHandler::ScheduleNextRun { thread: id });
                if let (Some(failure), Some(step)) = (failure, thread.step.as_mut()) {
                    if let Err(err) = step.execution.stop(failure) {
                        warn!(thread = inner, error = %err, "Failed to stop inner step");
                    }
                }
            }
            debug!(thread = id, inner, "Step completion waits for inner thread");
            return;
        }

        let Some(outcome) = context.outcome() else {
            warn!(thread = id, step = %context.function(), "Step was scheduled to complete without an outcome");
            return;
        };
        if let Err(err) = self.close_step(id, context, &outcome) {
            warn!(thread = id, error = %err, "Failed to record step completion");
        }
        if let Err(err) = self.resume(id, outcome) {
            warn!(thread = id, error = %err, "Failed to resume thread after step completion");
        }
    }

    /// 同步模式下排队的 body：第一个沿用调用者的 head，其余各自分叉
    fn launch_batch(&mut self, context: &StepContext, launches: Vec<BodyLaunch>) {
        let owner = context.thread_id();
        let Some(head) = self.threads.get(&owner).map(CpsThread::head) else {
            return;
        };
        let mut shared_free = self.next_inner(owner).is_none();
        let mut planned = Vec::with_capacity(launches.len());
        for launch in launches {
            let target = if shared_free {
                shared_free = false;
                Ok((head, false))
            } else {
                self.execution.fork_head(head).map(|forked| (forked, true))
            };
            planned.push((launch, target));
        }
        for (launch, target) in planned {
            match target {
                Ok((head, forked)) => self.launch_body(context, launch, head, forked, true),
                Err(err) => self.fail_launch(context, launch.index, err.into()),
            }
        }
    }

    /// 异步模式下启动 body：新线程可运行，由下一轮调度执行
    pub(crate) fn launch_async(&mut self, context: &StepContext, launch: BodyLaunch) {
        let owner = context.thread_id();
        let head = self
            .threads
            .get(&owner)
            .filter(|thread| {
                thread
                    .step
                    .as_ref()
                    .is_some_and(|step| step.context.id() == context.id())
            })
            .map(CpsThread::head);
        let Some(head) = head else {
            debug!(thread = owner, "Dropping body launch for a step that is no longer current");
            return;
        };
        if self.next_inner(owner).is_none() {
            self.launch_body(context, launch, head, false, false);
            return;
        }
        match self.execution.fork_head(head) {
            Ok(forked) => self.launch_body(context, launch, forked, true, false),
            Err(err) => self.fail_launch(context, launch.index, err.into()),
        }
    }

    fn launch_body(
        &mut self,
        context: &StepContext,
        launch: BodyLaunch,
        head: HeadId,
        forked: bool,
        inline: bool,
    ) {
        let index = launch.index;
        match self.prepare_body(context, launch, head, forked) {
            Ok((id, first)) if inline => {
                if let Some(thread) = self.threads.get_mut(&id) {
                    thread.resume_value = Some(first);
                }
                let outcome = self.run_next_chunk(id);
                if !self.threads.get(&id).is_some_and(CpsThread::is_alive) {
                    self.finish_thread(id, outcome);
                    self.release_id(id);
                }
            }
            Ok((id, first)) => {
                if let Err(err) = self.resume(id, first) {
                    warn!(thread = id, error = %err, "Failed to schedule body thread");
                }
            }
            Err(err) => {
                if forked {
                    self.execution.subsume_head(head);
                }
                self.fail_launch(context, index, err.into());
            }
        }
    }

    fn prepare_body(
        &mut self,
        context: &StepContext,
        launch: BodyLaunch,
        head: HeadId,
        forked: bool,
    ) -> Result<(ThreadId, Outcome)> {
        let execution = self.execution.clone();
        let parent = execution.head_node_id(head)?;
        let start = execution.create_node(
            FlowNodeKind::StepStart {
                function: context.function().to_string(),
            },
            vec![parent],
        );
        let start_id = start.id.clone();
        execution.set_new_head(head, start)?;
        let mut actions = vec![NodeAction::BodyInvocation];
        if let Some(label) = &launch.label {
            actions.push(NodeAction::label(label.clone()));
        }
        actions.extend(launch.start_actions);
        execution.add_actions(&start_id, actions)?;

        let closure = match &launch.source {
            BodySource::Exported(handle) => self.closures.get(handle).cloned().ok_or_else(|| {
                FlowError::ProgramNotLoaded(format!("closure {handle} is no longer exported"))
            })?,
            BodySource::Script(name) => Closure::script_root(name.clone()),
        };
        let code = self.script_code(&closure.script)?;
        let variables = ContextVariableSet::from(context.variables(), launch.overrides);
        let program = Program::script(Interpreter::for_closure(code, &closure));
        let id = self.add_thread(program, head, variables);
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.body = Some(BodyAdapter {
                owner: context.thread_id(),
                context: context.id().to_string(),
                index: launch.index,
                start: start_id,
                forked,
            });
        }
        let first = match context.body_started(launch.index, id) {
            Some(stopped) => Outcome::failure(stopped),
            None => Outcome::null(),
        };
        debug!(thread = id, owner = context.thread_id(), step = %context.function(), "Launched body");
        Ok((id, first))
    }

    fn fail_launch(&mut self, context: &StepContext, index: usize, failure: FlowFailure) {
        warn!(step = %context.function(), index, "Failed to launch body: {failure}");
        let outcome = Outcome::failure(failure);
        context.body_finished(index, outcome.clone());
        self.notify_body_complete(context, index, outcome);
    }

    fn notify_body_complete(&mut self, context: &StepContext, index: usize, outcome: Outcome) {
        let step = self
            .threads
            .get_mut(&context.thread_id())
            .and_then(|thread| thread.step.as_mut())
            .filter(|step| step.context.id() == context.id());
        let Some(step) = step else {
            debug!(step = %context.function(), index, "Body finished after its step moved on");
            return;
        };
        if let Err(err) = step.execution.on_body_complete(index, outcome) {
            warn!(step = %context.function(), index, error = %err, "Body completion callback failed");
            if !context.is_completed() {
                context.fail_quietly(err);
            }
        }
    }

    /// body 线程结束：补上结束节点，合并分叉的 head，通知发起的步骤
    pub(crate) fn complete_body(&mut self, thread: &CpsThread, adapter: BodyAdapter, outcome: Outcome) {
        let execution = self.execution.clone();
        let context = self
            .threads
            .get(&adapter.owner)
            .and_then(|owner| owner.step.as_ref())
            .filter(|step| step.context.id() == adapter.context)
            .map(|step| step.context.clone());

        let function = execution
            .node(&adapter.start)
            .ok()
            .and_then(|node| node.function_name().map(str::to_string))
            .unwrap_or_default();
        let ended = execution.head_node_id(thread.head).and_then(|parent| {
            let end = execution.create_node(
                FlowNodeKind::StepEnd {
                    function,
                    start_id: adapter.start.clone(),
                },
                vec![parent],
            );
            let end_id = end.id.clone();
            execution.set_new_head(thread.head, end)?;
            execution.add_action(&end_id, NodeAction::BodyInvocation)?;
            Ok(end_id)
        });
        match ended {
            Ok(end_id) => {
                if let Outcome::Abnormal(failure) = &outcome {
                    self.add_error_action(&end_id, failure);
                }
                if adapter.forked {
                    if let Some(context) = &context {
                        context.join(end_id);
                    }
                }
            }
            Err(err) => warn!(thread = thread.id(), error = %err, "Failed to record end of body"),
        }
        if adapter.forked {
            execution.subsume_head(thread.head);
        }

        let Some(context) = context else {
            debug!(thread = thread.id(), "Body finished after its step moved on");
            return;
        };
        context.body_finished(adapter.index, outcome.clone());
        self.notify_body_complete(&context, adapter.index, outcome);
    }

    /// 取消 body 线程及其派生的线程，由内向外
    pub(crate) fn cancel_body(&mut self, thread: ThreadId, failure: FlowFailure) {
        let mut targets = vec![thread];
        for (&id, candidate) in self.threads.range(thread + 1..) {
            if candidate
                .body
                .as_ref()
                .is_some_and(|body| targets.contains(&body.owner))
            {
                targets.push(id);
            }
        }
        for id in targets.into_iter().rev() {
            self.interrupt_thread(id, failure.clone());
        }
    }
}
