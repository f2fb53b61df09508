use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::error::{FlowError, Result};
use crate::flow::NodeAction;
use crate::script::{Closure, CompiledScript, Continuable, Program, ScriptSet, Yielded, MAIN_SCRIPT};
use crate::state::{write_atomically, ContextVariableSet};

use super::execution::FlowExecution;
use super::persistence::{self, ProgramState};
use super::task::TaskResult;
use super::thread::{CompletionHandler, CpsThread, HeadId, ThreadId, ThreadInfo};
use super::vm::{ProgramHandle, VmJob};
use super::{FlowFailure, Outcome};

/// 一次流程执行的全部线程
///
/// 只由 VM 任务持有和修改；外部通过 [`ProgramHandle`] 投递工作。
pub struct ThreadGroup {
    pub(crate) execution: Arc<FlowExecution>,
    pub(crate) handle: ProgramHandle,
    inbox: mpsc::UnboundedReceiver<VmJob>,
    pub(crate) threads: BTreeMap<ThreadId, CpsThread>,
    pub(crate) closures: BTreeMap<u32, Closure>,
    pub(crate) iota: u32,
    /// 闭包句柄单独计数，线程 id 保持紧凑
    pub(crate) closure_iota: u32,
    pub(crate) scripts: ScriptSet,
    dirty: bool,
    finished: bool,
}

impl ThreadGroup {
    pub(crate) fn new(
        execution: Arc<FlowExecution>,
        handle: ProgramHandle,
        inbox: mpsc::UnboundedReceiver<VmJob>,
        scripts: ScriptSet,
    ) -> Self {
        Self {
            execution,
            handle,
            inbox,
            threads: BTreeMap::new(),
            closures: BTreeMap::new(),
            iota: 0,
            closure_iota: 0,
            scripts,
            dirty: false,
            finished: false,
        }
    }

    pub fn execution(&self) -> &Arc<FlowExecution> {
        &self.execution
    }

    pub(crate) fn execution_url(&self) -> String {
        self.execution.url()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn thread(&self, id: ThreadId) -> Option<&CpsThread> {
        self.threads.get(&id)
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> Result<&mut CpsThread> {
        self.threads
            .get_mut(&id)
            .ok_or(FlowError::UnknownThread(id))
    }

    pub(crate) fn next_id(&mut self) -> u32 {
        let id = self.iota;
        self.iota += 1;
        id
    }

    pub(crate) fn add_thread(
        &mut self,
        program: Program,
        head: HeadId,
        variables: ContextVariableSet,
    ) -> ThreadId {
        let id = self.next_id();
        self.threads
            .insert(id, CpsThread::new(id, program, head, variables));
        debug!(thread = id, head, "Added thread");
        id
    }

    /// 同步跑完的 body 线程从未对外可见，归还它的 id
    pub(crate) fn release_id(&mut self, id: ThreadId) {
        if self.iota == id + 1 && !self.threads.contains_key(&id) {
            trace!(thread = id, "Released id of synchronous body");
            self.iota = id;
        }
    }

    /// 导出闭包，返回可持久化的句柄
    pub(crate) fn export(&mut self, closure: Closure) -> u32 {
        let handle = self.closure_iota;
        self.closure_iota += 1;
        self.closures.insert(handle, closure);
        handle
    }

    pub(crate) fn unexport(&mut self, handle: u32) {
        self.closures.remove(&handle);
    }

    /// 取得脚本的编译结果，必要时从执行记录中的源码重新编译
    pub(crate) fn script_code(&mut self, name: &str) -> Result<Arc<CompiledScript>> {
        if let Some(code) = self.scripts.get(name) {
            return Ok(code);
        }
        let source = if name == MAIN_SCRIPT {
            self.execution.script().to_string()
        } else {
            self.execution.loaded_script(name).ok_or_else(|| {
                FlowError::ProgramNotLoaded(format!("no source recorded for script `{name}`"))
            })?
        };
        self.scripts.compile(name, &source)
    }

    /// 设置线程的 resume 值并请求运行；返回该线程下一段执行结果的接收端
    pub fn resume(&mut self, id: ThreadId, outcome: Outcome) -> Result<oneshot::Receiver<Outcome>> {
        let thread = self.thread_mut(id)?;
        if thread.resume_value.is_some() {
            return Err(FlowError::ThreadAlreadyResumed(id));
        }
        trace!(thread = id, "Resuming thread");
        thread.resume_value = Some(outcome);
        let (tx, rx) = oneshot::channel();
        thread.promise = Some(tx);
        self.request_run();
        Ok(rx)
    }

    pub(crate) fn request_run(&self) {
        // 提交在调用时已经完成
        drop(self.handle.schedule_run());
    }

    pub(crate) async fn next_job(&mut self) -> Option<VmJob> {
        let job = self.inbox.recv().await;
        if job.is_some() {
            self.handle.job_taken();
        }
        job
    }

    pub(crate) fn dispatch(&mut self, job: VmJob) {
        match job {
            VmJob::Run(reply) => {
                self.run();
                let _ = reply.send(());
            }
            VmJob::Task(task) => {
                self.handle.set_busy(true);
                task(self);
                self.dirty = true;
                self.handle.set_busy(false);
                self.publish_stats();
                if !self.finished {
                    self.request_run();
                }
            }
            VmJob::Call(task) => {
                task(self);
                self.publish_stats();
            }
        }
    }

    fn drain_inbox(&mut self, replies: &mut Vec<oneshot::Sender<()>>) -> bool {
        let mut changed = false;
        while !self.finished {
            let Ok(job) = self.inbox.try_recv() else {
                break;
            };
            self.handle.job_taken();
            match job {
                VmJob::Run(reply) => replies.push(reply),
                VmJob::Task(task) => {
                    task(self);
                    changed = true;
                }
                VmJob::Call(task) => task(self),
            }
        }
        changed
    }

    /// 运行所有可运行线程直到不动点，然后在有进展时保存程序状态
    pub(crate) fn run(&mut self) {
        self.handle.set_busy(true);
        let mut did_work = std::mem::take(&mut self.dirty);
        let mut replies = Vec::new();
        loop {
            let mut changed = self.drain_inbox(&mut replies);
            let ids: Vec<ThreadId> = self.threads.keys().copied().collect();
            for id in ids {
                if self.finished {
                    break;
                }
                if !self.threads.get(&id).is_some_and(CpsThread::is_runnable) {
                    continue;
                }
                self.run_thread(id);
                changed = true;
            }
            did_work |= changed;
            if self.finished || !changed {
                break;
            }
        }
        if did_work && !self.finished {
            self.save_program();
        }
        if did_work {
            if let Err(err) = self.execution.save_record() {
                warn!(error = %err, "Failed to save flow execution record");
            }
        }
        self.publish_stats();
        self.handle.set_busy(false);
        for reply in replies {
            let _ = reply.send(());
        }
    }

    fn publish_stats(&self) {
        let runnable = self.threads.values().filter(|t| t.is_runnable()).count();
        self.handle.publish(self.threads.len(), runnable);
    }

    fn run_thread(&mut self, id: ThreadId) {
        let outcome = self.run_next_chunk(id);
        let alive = self.threads.get(&id).is_some_and(CpsThread::is_alive);
        if !alive {
            self.finish_thread(id, outcome);
        }
    }

    /// 用 resume 值驱动线程，沿途执行安全点任务，直到程序结束或挂起
    pub(crate) fn run_next_chunk(&mut self, id: ThreadId) -> Outcome {
        loop {
            let Some(thread) = self.threads.get_mut(&id) else {
                return Outcome::failure(FlowFailure::error(format!("thread {id} vanished")));
            };
            let Some(resume) = thread.resume_value.take() else {
                return Outcome::failure(FlowFailure::error(format!("thread {id} is not runnable")));
            };
            trace!(thread = id, "Running next chunk");
            let outcome = match thread.program.run(resume) {
                Yielded::Done(outcome) => outcome,
                Yielded::Task(task) => match self.eval_task(id, task) {
                    TaskResult::Resume(next) => {
                        if let Some(thread) = self.threads.get_mut(&id) {
                            thread.resume_value = Some(next);
                        }
                        continue;
                    }
                    TaskResult::Suspend(outcome) => outcome,
                },
            };
            if let Some(promise) = self.threads.get_mut(&id).and_then(|t| t.promise.take()) {
                let _ = promise.send(outcome.clone());
            }
            return outcome;
        }
    }

    /// 移除已结束的线程，回报结果并在最后一个线程结束时结束程序
    pub(crate) fn finish_thread(&mut self, id: ThreadId, outcome: Outcome) {
        let Some(mut thread) = self.threads.remove(&id) else {
            return;
        };
        if let Some(step) = thread.step.take() {
            self.unexport_bodies(&step.context);
        }
        let reported = match thread.body.take() {
            Some(adapter) => {
                self.complete_body(&thread, adapter, outcome);
                Outcome::null()
            }
            None => outcome,
        };
        if let Outcome::Abnormal(failure) = &reported {
            warn!(thread = id, "Thread failed: {failure}");
            self.execution.combine_result(failure.result());
            if let Err(err) = self.execution.mark_if_fail(thread.head, &reported) {
                warn!(thread = id, error = %err, "Failed to record error on flow node");
            }
        } else {
            debug!(thread = id, "Thread finished");
        }
        for handler in std::mem::take(&mut thread.completion_handlers) {
            self.fire(handler);
        }
        if self.threads.is_empty() {
            self.program_end(reported);
        }
    }

    fn fire(&mut self, handler: CompletionHandler) {
        match handler {
            CompletionHandler::ScheduleNextRun { thread } => {
                let context = self
                    .threads
                    .get(&thread)
                    .and_then(|t| t.step.as_ref())
                    .map(|step| step.context.clone());
                match context {
                    Some(context) => self.complete_step(&context),
                    None => debug!(thread, "No step left to complete"),
                }
            }
        }
    }

    fn program_end(&mut self, outcome: Outcome) {
        info!(execution = %self.execution.url(), "Program finished");
        self.finished = true;
        self.closures.clear();
        self.scripts.clear();
        self.handle.mark_finished();
        self.execution.on_program_end(&outcome);
    }

    pub(crate) fn snapshot(&self) -> Result<ProgramState> {
        persistence::snapshot(self)
    }

    fn save_program(&mut self) {
        let path = self.execution.program_file();
        let saved = self.snapshot().and_then(|state| {
            let bytes = serde_json::to_vec(&state)?;
            write_atomically(&path, &bytes)
        });
        match saved {
            Ok(()) => debug!(path = %path.display(), "Saved program state"),
            Err(err) => {
                warn!(error = %err, "Failed to save program state");
                self.propagate_error(err);
            }
        }
    }

    /// 保存失败时让流程感知：丢弃最后一个线程的当前步骤并以失败恢复它
    fn propagate_error(&mut self, err: FlowError) {
        let Some(&id) = self.threads.keys().next_back() else {
            return;
        };
        let step = self.threads.get_mut(&id).and_then(|t| t.step.take());
        if let Some(step) = step {
            self.unexport_bodies(&step.context);
        }
        let failure = FlowFailure::error(format!("Failed to persist program state: {err}"));
        if let Err(err) = self.resume(id, Outcome::failure(failure)) {
            warn!(thread = id, error = %err, "Could not deliver persistence failure");
        }
    }

    /// 中断单个线程：停止其当前步骤，或唤醒停在 pause 上的线程
    pub(crate) fn interrupt_thread(&mut self, id: ThreadId, failure: FlowFailure) {
        let Some(thread) = self.threads.get_mut(&id) else {
            return;
        };
        let runnable = thread.is_runnable();
        if let Some(step) = thread.step.as_mut() {
            debug!(thread = id, step = %step.context.function(), "Stopping step");
            if let Err(err) = step.execution.stop(failure) {
                warn!(thread = id, error = %err, "Failed to stop step");
            }
            return;
        }
        if !runnable {
            if let Err(err) = self.resume(id, Outcome::failure(failure)) {
                warn!(thread = id, error = %err, "Failed to interrupt thread");
            }
        }
    }

    /// 由内向外中断所有线程
    pub(crate) fn interrupt_all(&mut self, failure: FlowFailure) {
        let ids: Vec<ThreadId> = self.threads.keys().rev().copied().collect();
        info!(threads = ids.len(), "Interrupting all threads: {failure}");
        for id in ids {
            self.interrupt_thread(id, failure.clone());
        }
    }

    /// 重新加载后通知每个步骤
    ///
    /// 保存时已有结果的步骤不再调用 on_resume，直接完成
    pub(crate) fn resume_steps(&mut self) {
        let mut completed = Vec::new();
        for thread in self.threads.values_mut() {
            if let Some(step) = thread.step.as_mut() {
                if step.context.is_completed() {
                    completed.push(step.context.clone());
                    continue;
                }
                debug!(thread = thread.id, step = %step.context.function(), "Resuming step");
                step.execution.on_resume();
            }
        }
        for context in completed {
            debug!(thread = context.thread_id(), step = %context.function(), "Completing step finished before save");
            self.complete_step(&context);
        }
    }

    pub fn dump(&self) -> Vec<ThreadInfo> {
        self.threads
            .values()
            .map(|thread| ThreadInfo {
                id: thread.id,
                head: thread.head,
                node: self.execution.head_node_id(thread.head).ok(),
                runnable: thread.is_runnable(),
                step: thread
                    .step
                    .as_ref()
                    .map(|step| step.context.function().to_string()),
                owner: thread.body.as_ref().map(|body| body.owner),
            })
            .collect()
    }

    /// 同一 head 上比给定线程更新的第一个线程
    pub(crate) fn next_inner(&self, id: ThreadId) -> Option<ThreadId> {
        let head = self.threads.get(&id)?.head;
        self.threads
            .range(id + 1..)
            .find(|(_, thread)| thread.head == head)
            .map(|(id, _)| *id)
    }

    pub(crate) fn add_error_action(&self, node: &str, failure: &FlowFailure) {
        if let Err(err) = self.execution.add_action(
            node,
            NodeAction::Error {
                failure: failure.clone(),
            },
        ) {
            warn!(node, error = %err, "Failed to record error action");
        }
    }

    pub(crate) fn from_parts(
        execution: Arc<FlowExecution>,
        handle: ProgramHandle,
        inbox: mpsc::UnboundedReceiver<VmJob>,
        scripts: ScriptSet,
        threads: BTreeMap<ThreadId, CpsThread>,
        closures: BTreeMap<u32, Closure>,
        iota: u32,
        closure_iota: u32,
    ) -> Self {
        let mut group = Self::new(execution, handle, inbox, scripts);
        let next_handle = closures.keys().next_back().map_or(0, |handle| handle + 1);
        group.closure_iota = closure_iota.max(next_handle);
        group.threads = threads;
        group.closures = closures;
        group.iota = iota;
        group
    }
}
