use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

type TaskFn<T> = dyn Fn() -> BoxFuture<'static, T> + Send + Sync;

struct GateState<T> {
    pending: Option<Vec<oneshot::Sender<T>>>,
    in_progress: bool,
}

/// 最多同时运行一个任务的执行器
///
/// 提交的请求先进入待处理批次；运行中的任务结束后，下一批次合并为一次执行。
/// 同一批次的所有请求得到同一个结果。
pub struct AtMostOneTaskExecutor<T: Clone + Send + 'static> {
    task: Arc<TaskFn<T>>,
    state: Arc<Mutex<GateState<T>>>,
}

impl<T: Clone + Send + 'static> AtMostOneTaskExecutor<T> {
    pub fn new<F>(task: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, T> + Send + Sync + 'static,
    {
        Self {
            task: Arc::new(task),
            state: Arc::new(Mutex::new(GateState {
                pending: None,
                in_progress: false,
            })),
        }
    }

    /// 请求执行一次任务；返回的 future 在包含本请求的批次完成时就绪。
    /// 任务 panic 时返回 None。
    pub fn submit(&self) -> impl Future<Output = Option<T>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let start_runner = {
            let mut state = self.state.lock();
            state.pending.get_or_insert_with(Vec::new).push(tx);
            if state.in_progress {
                false
            } else {
                state.in_progress = true;
                true
            }
        };
        if start_runner {
            self.spawn_runner();
        }
        async move { rx.await.ok() }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().in_progress
    }

    fn spawn_runner(&self) {
        let task = Arc::clone(&self.task);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                let batch = {
                    let mut state = state.lock();
                    match state.pending.take() {
                        Some(batch) => batch,
                        None => {
                            state.in_progress = false;
                            break;
                        }
                    }
                };
                // 构造 future 时的 panic 也要拦住
                match AssertUnwindSafe(async { (task)().await }).catch_unwind().await {
                    Ok(value) => {
                        for waiter in batch {
                            let _ = waiter.send(value.clone());
                        }
                    }
                    Err(_) => warn!("Scheduled task panicked; dropping {} waiters", batch.len()),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn coalesces_concurrent_submissions() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            let runs = runs.clone();
            Arc::new(AtMostOneTaskExecutor::new(move || {
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                let runs = runs.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    "settled".to_string()
                }
                .boxed()
            }))
        };

        let mut waiters = Vec::new();
        for _ in 0..50 {
            let gate = gate.clone();
            waiters.push(tokio::spawn(async move { gate.submit().await }));
        }
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().as_deref(), Some("settled"));
        }
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert!(runs.load(Ordering::SeqCst) <= 50);
        assert!(!gate.is_running() || runs.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn survives_panicking_task() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = {
            let calls = calls.clone();
            AtMostOneTaskExecutor::new(move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        panic!("first run fails");
                    }
                    n
                }
                .boxed()
            })
        };
        assert_eq!(gate.submit().await, None);
        assert_eq!(gate.submit().await, Some(1));
    }

    #[tokio::test]
    async fn survives_panic_before_future_is_built() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = {
            let calls = calls.clone();
            AtMostOneTaskExecutor::new(move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    panic!("no future for the first run");
                }
                async move { n }.boxed()
            })
        };
        assert_eq!(gate.submit().await, None);
        assert!(!gate.is_running());
        assert_eq!(gate.submit().await, Some(1));
    }
}
