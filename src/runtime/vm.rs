use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{FlowError, Result};

use super::gate::AtMostOneTaskExecutor;
use super::group::ThreadGroup;

pub(crate) type VmTask = Box<dyn FnOnce(&mut ThreadGroup) + Send>;

/// 发往 VM 任务的工作
pub(crate) enum VmJob {
    /// 运行到不动点后回复
    Run(oneshot::Sender<()>),
    /// 修改线程组状态，结束后需要保存
    Task(VmTask),
    /// 只读或自行调度的调用
    Call(VmTask),
}

struct HandleInner {
    tx: mpsc::UnboundedSender<VmJob>,
    queued: AtomicUsize,
    threads: AtomicUsize,
    runnable: AtomicUsize,
    busy: AtomicBool,
    finished: AtomicBool,
    gate: AtMostOneTaskExecutor<()>,
}

impl HandleInner {
    fn send(&self, job: VmJob) -> Result<()> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.tx.send(job).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            FlowError::ProgramFinished
        })
    }
}

/// 线程组的外部句柄：所有访问都经由 VM 任务串行执行
#[derive(Clone)]
pub struct ProgramHandle {
    inner: Arc<HandleInner>,
}

impl ProgramHandle {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<VmJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak: &Weak<HandleInner>| {
            let weak = weak.clone();
            HandleInner {
                tx,
                queued: AtomicUsize::new(0),
                threads: AtomicUsize::new(0),
                runnable: AtomicUsize::new(0),
                busy: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                gate: AtMostOneTaskExecutor::new(move || {
                    let weak = weak.clone();
                    async move {
                        let Some(inner) = weak.upgrade() else {
                            return;
                        };
                        let (reply, done) = oneshot::channel();
                        let sent = inner.send(VmJob::Run(reply));
                        drop(inner);
                        if sent.is_ok() {
                            let _ = done.await;
                        }
                    }
                    .boxed()
                }),
            }
        });
        (Self { inner }, rx)
    }

    /// 请求一次运行；提交立即发生，返回的 future 在该批次运行结束时就绪
    pub fn schedule_run(&self) -> impl Future<Output = ()> + Send + 'static {
        let submitted = self.inner.gate.submit();
        async move {
            let _ = submitted.await;
        }
    }

    /// 在 VM 中执行修改线程组的任务
    pub fn run_in_vm<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut ThreadGroup) + Send + 'static,
    {
        self.inner.send(VmJob::Task(Box::new(task)))
    }

    /// 在 VM 中执行并取回结果
    pub async fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ThreadGroup) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.inner.send(VmJob::Call(Box::new(move |group| {
            let _ = tx.send(f(group));
        })))?;
        rx.await.map_err(|_| FlowError::ProgramFinished)
    }

    pub fn thread_count(&self) -> usize {
        self.inner.threads.load(Ordering::SeqCst)
    }

    pub fn runnable_count(&self) -> usize {
        self.inner.runnable.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst) || self.inner.gate.is_running()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    /// 没有排队的工作，也没有可运行的线程
    pub fn is_settled(&self) -> bool {
        self.inner.queued.load(Ordering::SeqCst) == 0
            && self.runnable_count() == 0
            && !self.inner.busy.load(Ordering::SeqCst)
    }

    pub(crate) fn job_taken(&self) {
        self.inner.queued.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.inner.busy.store(busy, Ordering::SeqCst);
    }

    pub(crate) fn publish(&self, threads: usize, runnable: usize) {
        self.inner.threads.store(threads, Ordering::SeqCst);
        self.inner.runnable.store(runnable, Ordering::SeqCst);
    }

    pub(crate) fn mark_finished(&self) {
        self.inner.finished.store(true, Ordering::SeqCst);
    }
}

/// 启动拥有线程组的 VM 任务
pub(crate) fn spawn_vm(mut group: ThreadGroup) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(execution = %group.execution_url(), "VM started");
        while let Some(job) = group.next_job().await {
            group.dispatch(job);
            if group.is_finished() {
                break;
            }
        }
        info!(execution = %group.execution_url(), "VM stopped");
    })
}
