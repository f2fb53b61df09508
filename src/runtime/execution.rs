use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::StorageKind;
use crate::error::{FlowError, Result};
use crate::flow::{FlowGraphWalker, FlowNode, FlowNodeKind, FlowResult, NodeAction, NodeId};
use crate::script::{Interpreter, Program, ScriptSet, MAIN_SCRIPT};
use crate::state::{
    write_atomically, ContextVariableSet, FileNodeStorage, FlowNodeStorage, MemoryNodeStorage,
    PickleRegistry,
};
use crate::steps::StepRegistry;

use super::group::ThreadGroup;
use super::owner::{Executable, FlowExecutionOwner};
use super::persistence::{self, PROGRAM_FILE, RECORD_FILE};
use super::thread::{HeadId, ThreadId, ThreadInfo};
use super::vm::{spawn_vm, ProgramHandle};
use super::{FlowFailure, InterruptCause, Outcome};

/// 新 head 节点的监听器
pub trait GraphListener: Send + Sync {
    fn on_new_head(&self, node: &FlowNode);
}

/// 执行所需的步骤、pickle 工厂与存储方式
#[derive(Clone)]
pub struct FlowEnvironment {
    pub steps: Arc<StepRegistry>,
    pub pickles: Arc<PickleRegistry>,
    pub storage: StorageKind,
}

impl FlowEnvironment {
    pub fn new(steps: StepRegistry) -> Self {
        Self {
            steps: Arc::new(steps),
            pickles: Arc::new(PickleRegistry::new()),
            storage: StorageKind::default(),
        }
    }

    pub fn with_pickles(mut self, pickles: PickleRegistry) -> Self {
        self.pickles = Arc::new(pickles);
        self
    }

    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.storage = storage;
        self
    }
}

impl Default for FlowEnvironment {
    fn default() -> Self {
        Self::new(StepRegistry::with_builtins())
    }
}

/// 流程定义：脚本与沙箱标志
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub script: String,
    #[serde(default)]
    pub sandbox: bool,
}

impl FlowDefinition {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            sandbox: false,
        }
    }

    pub fn sandboxed(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn create_execution(
        &self,
        owner: Arc<dyn FlowExecutionOwner>,
        env: FlowEnvironment,
    ) -> Arc<FlowExecution> {
        let record = ExecutionRecord {
            script: self.script.clone(),
            sandbox: self.sandbox,
            loaded_scripts: BTreeMap::new(),
            result: FlowResult::Success,
            heads: BTreeMap::new(),
            start_nodes: Vec::new(),
            iota: 0,
            complete: false,
            owner: owner.executable(),
            storage: env.storage,
        };
        let execution = Arc::new(FlowExecution::from_record(owner.clone(), env, record));
        owner.attach(Arc::downgrade(&execution));
        execution
    }
}

/// 执行记录：小而频繁地写出
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub script: String,
    #[serde(default)]
    pub sandbox: bool,
    #[serde(default)]
    pub loaded_scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub result: FlowResult,
    #[serde(default)]
    pub heads: BTreeMap<HeadId, NodeId>,
    #[serde(default)]
    pub start_nodes: Vec<NodeId>,
    pub iota: u32,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub owner: Option<Executable>,
    #[serde(default)]
    pub storage: StorageKind,
}

struct ExecutionState {
    heads: BTreeMap<HeadId, NodeId>,
    start_nodes: Vec<NodeId>,
    result: FlowResult,
    complete: bool,
    loaded_scripts: BTreeMap<String, String>,
}

#[derive(Clone)]
enum ProgramSlot {
    Idle,
    Loading,
    Ready(ProgramHandle),
    Finished,
}

/// 流程执行：协调线程组生命周期与执行历史图
pub struct FlowExecution {
    owner: Arc<dyn FlowExecutionOwner>,
    script: String,
    sandbox: bool,
    env: FlowEnvironment,
    storage: Arc<dyn FlowNodeStorage>,
    state: Mutex<ExecutionState>,
    iota: AtomicU32,
    program: watch::Sender<ProgramSlot>,
    completed: watch::Sender<bool>,
    listeners: RwLock<Vec<Arc<dyn GraphListener>>>,
    console: Mutex<Vec<String>>,
}

impl FlowExecution {
    fn from_record(
        owner: Arc<dyn FlowExecutionOwner>,
        env: FlowEnvironment,
        record: ExecutionRecord,
    ) -> Self {
        let storage: Arc<dyn FlowNodeStorage> = match record.storage {
            StorageKind::File => Arc::new(FileNodeStorage::new(owner.root_dir().join("workflow"))),
            StorageKind::Memory => Arc::new(MemoryNodeStorage::new()),
        };
        let (program, _) = watch::channel(if record.complete {
            ProgramSlot::Finished
        } else {
            ProgramSlot::Idle
        });
        let (completed, _) = watch::channel(record.complete);
        Self {
            owner,
            script: record.script,
            sandbox: record.sandbox,
            env,
            storage,
            state: Mutex::new(ExecutionState {
                heads: record.heads,
                start_nodes: record.start_nodes,
                result: record.result,
                complete: record.complete,
                loaded_scripts: record.loaded_scripts,
            }),
            iota: AtomicU32::new(record.iota),
            program,
            completed,
            listeners: RwLock::new(Vec::new()),
            console: Mutex::new(Vec::new()),
        }
    }

    /// 从所有者目录重新加载执行；未完成时在后台恢复程序状态
    pub async fn load(
        owner: Arc<dyn FlowExecutionOwner>,
        env: FlowEnvironment,
    ) -> Result<Arc<FlowExecution>> {
        let path = owner.root_dir().join(RECORD_FILE);
        let bytes = tokio::fs::read(&path).await?;
        let record: ExecutionRecord = serde_json::from_slice(&bytes)?;
        let execution = Arc::new(Self::from_record(owner.clone(), env, record));
        owner.attach(Arc::downgrade(&execution));
        if !execution.is_complete() {
            execution.program.send_replace(ProgramSlot::Loading);
            let loading = execution.clone();
            tokio::spawn(async move { loading.load_program().await });
        }
        info!(execution = %execution.url(), "Loaded flow execution");
        Ok(execution)
    }

    async fn load_program(self: Arc<Self>) {
        match persistence::load_group(&self).await {
            Ok(group) => {
                let handle = group.handle.clone();
                self.program.send_replace(ProgramSlot::Ready(handle.clone()));
                spawn_vm(group);
                if let Err(err) = handle.run_in_vm(ThreadGroup::resume_steps) {
                    warn!(error = %err, "Failed to resume steps");
                }
                handle.schedule_run().await;
            }
            Err(err) => self.load_failed(err),
        }
    }

    /// 无法恢复时，合成一个立即失败的线程，让失败出现在流程自身的历史与结果中
    fn load_failed(self: &Arc<Self>, problem: FlowError) {
        warn!(execution = %self.url(), error = %problem, "Failed to load program state");
        let head = match self.first_head() {
            Some(head) => Ok(head),
            None => {
                let start = self.create_node(FlowNodeKind::FlowStart, Vec::new());
                self.state.lock().start_nodes.push(start.id.clone());
                self.new_head(start)
            }
        };
        let head = match head {
            Ok(head) => head,
            Err(err) => {
                error!(execution = %self.url(), error = %err, "Cannot record load failure");
                self.program.send_replace(ProgramSlot::Finished);
                return;
            }
        };
        let (handle, inbox) = ProgramHandle::new();
        let mut group = ThreadGroup::new(self.clone(), handle.clone(), inbox, ScriptSet::new());
        let failure = FlowFailure::LoadFailed {
            cause: problem.to_string(),
        };
        let id = group.add_thread(Program::throwing(failure), head, ContextVariableSet::empty());
        self.program.send_replace(ProgramSlot::Ready(handle));
        if let Err(err) = group.resume(id, Outcome::null()) {
            warn!(error = %err, "Failed to schedule load failure");
        }
        spawn_vm(group);
    }

    /// 启动执行：编译主脚本，建立起始节点与主线程
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !matches!(*self.program.borrow(), ProgramSlot::Idle) {
            return Err(FlowError::Other(anyhow::anyhow!(
                "execution {} was already started",
                self.url()
            )));
        }
        let mut scripts = ScriptSet::new();
        let code = scripts.compile(MAIN_SCRIPT, &self.script)?;

        let start = self.create_node(FlowNodeKind::FlowStart, Vec::new());
        self.state.lock().start_nodes.push(start.id.clone());
        let head = self.new_head(start)?;
        self.save_record()?;

        let (handle, inbox) = ProgramHandle::new();
        let mut group = ThreadGroup::new(self.clone(), handle.clone(), inbox, scripts);
        let program = Program::script(Interpreter::new(code, 0, BTreeMap::new()));
        let id = group.add_thread(program, head, ContextVariableSet::empty());
        self.program.send_replace(ProgramSlot::Ready(handle));
        group.resume(id, Outcome::null())?;
        spawn_vm(group);
        info!(execution = %self.url(), "Started flow execution");
        Ok(())
    }

    pub fn url(&self) -> String {
        self.owner.url()
    }

    pub fn owner(&self) -> &Arc<dyn FlowExecutionOwner> {
        &self.owner
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandbox
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.env.steps
    }

    pub fn pickles(&self) -> &PickleRegistry {
        &self.env.pickles
    }

    pub fn storage(&self) -> Arc<dyn FlowNodeStorage> {
        self.storage.clone()
    }

    pub fn program_file(&self) -> PathBuf {
        self.owner.root_dir().join(PROGRAM_FILE)
    }

    fn record_file(&self) -> PathBuf {
        self.owner.root_dir().join(RECORD_FILE)
    }

    pub fn loaded_script(&self, name: &str) -> Option<String> {
        self.state.lock().loaded_scripts.get(name).cloned()
    }

    /// 记录运行时加载的脚本，返回其编译名
    pub fn add_loaded_script(&self, source: impl Into<String>) -> String {
        let mut state = self.state.lock();
        let name = format!("Script{}", state.loaded_scripts.len() + 2);
        state.loaded_scripts.insert(name.clone(), source.into());
        name
    }

    pub(crate) fn script_source(&self, name: &str) -> Result<String> {
        if name == MAIN_SCRIPT {
            return Ok(self.script.clone());
        }
        self.loaded_script(name).ok_or_else(|| {
            FlowError::ProgramNotLoaded(format!("no source recorded for script `{name}`"))
        })
    }

    fn next_iota(&self) -> u32 {
        self.iota.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 分配新的节点 id；节点在放到某个 head 上时才写入存储
    pub fn create_node(&self, kind: FlowNodeKind, parents: Vec<NodeId>) -> FlowNode {
        FlowNode::new(self.next_iota().to_string(), parents, kind)
    }

    pub fn node(&self, id: &str) -> Result<FlowNode> {
        self.storage
            .get_node(id)?
            .ok_or_else(|| FlowError::UnknownNode(id.to_string()))
    }

    pub fn actions(&self, id: &str) -> Result<Vec<NodeAction>> {
        self.storage.load_actions(id)
    }

    pub fn add_action(&self, id: &str, action: NodeAction) -> Result<()> {
        self.add_actions(id, vec![action])
    }

    pub fn add_actions(&self, id: &str, actions: Vec<NodeAction>) -> Result<()> {
        let mut existing = self.storage.load_actions(id)?;
        existing.extend(actions);
        self.storage.save_actions(id, &existing)
    }

    pub fn head_node_id(&self, head: HeadId) -> Result<NodeId> {
        self.state
            .lock()
            .heads
            .get(&head)
            .cloned()
            .ok_or(FlowError::UnknownHead(head))
    }

    pub fn head_node(&self, head: HeadId) -> Result<FlowNode> {
        self.node(&self.head_node_id(head)?)
    }

    fn first_head(&self) -> Option<HeadId> {
        self.state.lock().heads.keys().next().copied()
    }

    /// 以新节点开一个 head
    pub fn new_head(&self, node: FlowNode) -> Result<HeadId> {
        let id = self.next_iota();
        self.storage.store_node(&node)?;
        self.state.lock().heads.insert(id, node.id.clone());
        self.notify(&node);
        Ok(id)
    }

    /// 从已有 head 的当前节点分叉
    pub fn fork_head(&self, head: HeadId) -> Result<HeadId> {
        let node = self.head_node_id(head)?;
        let id = self.next_iota();
        self.state.lock().heads.insert(id, node);
        Ok(id)
    }

    /// 存储节点并把 head 移到该节点上
    pub fn set_new_head(&self, head: HeadId, node: FlowNode) -> Result<()> {
        self.storage.store_node(&node)?;
        self.state.lock().heads.insert(head, node.id.clone());
        debug!(head, node = %node.id, "New head");
        self.notify(&node);
        Ok(())
    }

    /// 移除已被合并的 head
    pub fn subsume_head(&self, head: HeadId) {
        self.state.lock().heads.remove(&head);
    }

    fn notify(&self, node: &FlowNode) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_new_head(node);
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn GraphListener>) {
        self.listeners.write().push(listener);
    }

    /// 结果失败时在 head 的节点上记录错误
    pub fn mark_if_fail(&self, head: HeadId, outcome: &Outcome) -> Result<()> {
        if let Outcome::Abnormal(failure) = outcome {
            let node = self.head_node_id(head)?;
            self.add_action(
                &node,
                NodeAction::Error {
                    failure: failure.clone(),
                },
            )?;
        }
        Ok(())
    }

    pub fn current_heads(&self) -> Result<Vec<FlowNode>> {
        let ids: Vec<NodeId> = self.state.lock().heads.values().cloned().collect();
        ids.iter().map(|id| self.node(id)).collect()
    }

    pub fn walker(&self) -> Result<FlowGraphWalker> {
        Ok(FlowGraphWalker::new(self.storage.clone(), self.current_heads()?))
    }

    pub fn result(&self) -> FlowResult {
        self.state.lock().result
    }

    /// 合并结果，只会变差
    pub fn set_result(&self, result: FlowResult) {
        self.combine_result(result);
    }

    pub(crate) fn combine_result(&self, result: FlowResult) {
        let mut state = self.state.lock();
        state.result = state.result.combine(result);
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    pub fn console(&self) -> Vec<String> {
        self.console.lock().clone()
    }

    pub fn println(&self, line: &str) {
        tracing::info!(target: crate::utils::logging::CONSOLE_TARGET, execution = %self.url(), "{line}");
        self.console.lock().push(line.to_string());
        let path = self.owner.root_dir().join("log");
        let appended = std::fs::create_dir_all(self.owner.root_dir()).and_then(|_| {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{line}")
        });
        if let Err(err) = appended {
            warn!(path = %path.display(), error = %err, "Failed to append console log");
        }
    }

    pub fn record(&self) -> ExecutionRecord {
        let state = self.state.lock();
        ExecutionRecord {
            script: self.script.clone(),
            sandbox: self.sandbox,
            loaded_scripts: state.loaded_scripts.clone(),
            result: state.result,
            heads: state.heads.clone(),
            start_nodes: state.start_nodes.clone(),
            iota: self.iota.load(Ordering::SeqCst),
            complete: state.complete,
            owner: self.owner.executable(),
            storage: self.env.storage,
        }
    }

    pub fn save_record(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.record())?;
        write_atomically(&self.record_file(), &bytes)
    }

    async fn program_handle(&self) -> Option<ProgramHandle> {
        let mut rx = self.program.subscribe();
        let slot = rx
            .wait_for(|slot| !matches!(slot, ProgramSlot::Loading))
            .await
            .ok()?;
        match &*slot {
            ProgramSlot::Ready(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// 程序是否已在内存中可用
    pub fn is_ready(&self) -> bool {
        matches!(*self.program.borrow(), ProgramSlot::Ready(_))
    }

    pub async fn schedule_run(&self) {
        if let Some(handle) = self.program_handle().await {
            handle.schedule_run().await;
        }
    }

    /// 在 VM 中执行修改线程组的任务；程序仍在加载时排到加载完成之后
    pub fn run_in_vm<F>(self: &Arc<Self>, task: F) -> Result<()>
    where
        F: FnOnce(&mut ThreadGroup) + Send + 'static,
    {
        let slot = self.program.borrow().clone();
        match slot {
            ProgramSlot::Ready(handle) => handle.run_in_vm(task),
            ProgramSlot::Loading => {
                let execution = self.clone();
                tokio::spawn(async move {
                    if let Some(handle) = execution.program_handle().await {
                        if let Err(err) = handle.run_in_vm(task) {
                            warn!(error = %err, "Dropped VM task after load");
                        }
                    }
                });
                Ok(())
            }
            ProgramSlot::Idle => Err(FlowError::ProgramNotLoaded(format!(
                "execution {} has not started",
                self.url()
            ))),
            ProgramSlot::Finished => Err(FlowError::ProgramFinished),
        }
    }

    /// 等待所有线程都不可运行且没有排队的工作
    pub async fn wait_for_suspension(&self) -> Result<()> {
        let Some(handle) = self.program_handle().await else {
            return Ok(());
        };
        loop {
            handle.schedule_run().await;
            if handle.is_finished() || handle.is_settled() {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }

    pub async fn wait_for_completion(&self) -> Result<FlowResult> {
        let mut rx = self.completed.subscribe();
        rx.wait_for(|done| *done)
            .await
            .map_err(|_| FlowError::ProgramFinished)?;
        Ok(self.result())
    }

    /// 向所有活动步骤投递中断
    pub async fn interrupt(&self, result: FlowResult, causes: Vec<InterruptCause>) -> Result<()> {
        let Some(handle) = self.program_handle().await else {
            return Ok(());
        };
        let failure = FlowFailure::interrupted(result, causes);
        info!(execution = %self.url(), "Interrupting: {failure}");
        match handle.call(move |group| group.interrupt_all(failure)).await {
            Err(FlowError::ProgramFinished) => Ok(()),
            other => other,
        }
    }

    /// 唤醒停在 pause 上的线程
    pub async fn resume_thread(&self, thread: ThreadId, outcome: Outcome) -> Result<()> {
        let handle = self
            .program_handle()
            .await
            .ok_or(FlowError::ProgramFinished)?;
        handle
            .call(move |group| group.resume(thread, outcome).map(drop))
            .await?
    }

    pub async fn thread_dump(&self) -> Result<Vec<ThreadInfo>> {
        let Some(handle) = self.program_handle().await else {
            return Ok(Vec::new());
        };
        match handle.call(|group| group.dump()).await {
            Err(FlowError::ProgramFinished) => Ok(Vec::new()),
            other => other,
        }
    }

    /// 程序仍在加载或还有工作在进行时不宜重启
    pub fn blocks_restart(&self) -> bool {
        match &*self.program.borrow() {
            ProgramSlot::Loading => true,
            ProgramSlot::Ready(handle) => !handle.is_finished() && !handle.is_settled(),
            ProgramSlot::Idle | ProgramSlot::Finished => false,
        }
    }

    /// 最后一个线程结束：封闭执行历史图并标记完成
    pub(crate) fn on_program_end(&self, outcome: &Outcome) {
        if let Outcome::Abnormal(failure) = outcome {
            self.combine_result(failure.result());
        }
        let (start_id, parents, first_head, result) = {
            let mut state = self.state.lock();
            let start_id = state.start_nodes.pop().unwrap_or_default();
            let mut parents: Vec<NodeId> = Vec::new();
            for node in state.heads.values() {
                if !parents.contains(node) {
                    parents.push(node.clone());
                }
            }
            let first_head = state.heads.keys().next().copied();
            (start_id, parents, first_head, state.result)
        };
        let end = self.create_node(FlowNodeKind::FlowEnd { start_id, result }, parents);
        let end_id = end.id.clone();
        let sealed = match first_head {
            Some(head) => self.set_new_head(head, end),
            None => self.new_head(end).map(drop),
        };
        if let Err(err) = sealed {
            error!(execution = %self.url(), error = %err, "Failed to record end of flow");
        }
        if let Outcome::Abnormal(failure) = outcome {
            if let Err(err) = self.add_action(
                &end_id,
                NodeAction::Error {
                    failure: failure.clone(),
                },
            ) {
                warn!(error = %err, "Failed to record flow failure");
            }
        }
        {
            let mut state = self.state.lock();
            state.heads.retain(|_, node| *node == end_id);
            state.complete = true;
        }

        let program_file = self.program_file();
        if program_file.exists() {
            if let Err(err) = std::fs::remove_file(&program_file) {
                warn!(path = %program_file.display(), error = %err, "Failed to delete program state");
            }
        }
        if let Err(err) = self.save_record() {
            warn!(error = %err, "Failed to save flow execution record");
        }
        info!(execution = %self.url(), result = %result, "Flow completed");
        self.program.send_replace(ProgramSlot::Finished);
        self.completed.send_replace(true);
        for descriptor in self.env.steps.descriptors() {
            descriptor.on_flow_completed(self);
        }
    }
}
