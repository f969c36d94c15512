use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{future::BoxFuture, future::join_all, FutureExt};
use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::error::{Error, Result};

/// A unit of work executed off the VM thread.
///
/// The task learns about its deadline through the [`TaskContext`]. Whatever it
/// returns is only logged: results reach the script through a channel the task
/// closes over.
pub type AsyncTask = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, Result<()>> + Send>;

/// Boxes a closure into an [`AsyncTask`].
pub fn task<F, Fut>(f: F) -> AsyncTask
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |ctx| f(ctx).boxed())
}

/// Deadline a worker attached to the task it is running.
#[derive(Clone, Copy, Debug)]
pub struct TaskContext {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl TaskContext {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drives `fut`, giving up with [`Error::Timeout`] once the deadline passes.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match (self.deadline, self.timeout) {
            (Some(deadline), Some(timeout)) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| Error::Timeout(timeout))?,
            _ => fut.await,
        }
    }
}

struct Running {
    tx: mpsc::Sender<AsyncTask>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

/// Fixed-size pool of tokio tasks draining a bounded queue.
///
/// `add` blocks while the queue is full. `stop` lets every worker finish the
/// task it is running, waits for all of them, and discards whatever is still
/// queued. `start` brings up a fresh queue and a fresh set of workers with the
/// same sizes.
pub struct AsyncPool {
    handle: Handle,
    concurrency: usize,
    buffer_size: usize,
    timeout: Option<Duration>,
    running: Mutex<Option<Running>>,
    submitted: AtomicU64,
    finished: Arc<AtomicU64>,
}

impl AsyncPool {
    pub fn new(
        handle: Handle,
        concurrency: usize,
        buffer_size: usize,
        timeout: Option<Duration>,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            handle,
            concurrency,
            buffer_size: buffer_size.max(concurrency),
            timeout: timeout.filter(|t| !t.is_zero()),
            running: Mutex::new(None),
            submitted: AtomicU64::new(0),
            finished: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Tasks accepted since the pool was created.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Tasks run to completion since the pool was created.
    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    /// Spawns the workers. Does nothing when the pool is already running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        tracing::debug!("Spawning {} async workers", self.concurrency);
        let workers = (0..self.concurrency)
            .map(|id| {
                self.handle.spawn(worker(
                    id,
                    rx.clone(),
                    shutdown_rx.clone(),
                    self.timeout,
                    self.finished.clone(),
                ))
            })
            .collect();

        *running = Some(Running {
            tx,
            shutdown,
            workers,
        });
    }

    /// Signals every worker, then blocks until each one has finished its
    /// current task. Must not be called from inside the runtime.
    pub fn stop(&self) {
        let Some(Running {
            tx,
            shutdown,
            workers,
        }) = self.running.lock().take()
        else {
            return;
        };
        let _ = shutdown.send(true);
        drop(tx);
        for joined in futures::executor::block_on(join_all(workers)) {
            if let Err(e) = joined {
                tracing::error!("Async worker panicked: {e}");
            }
        }
    }

    /// Async flavour of [`stop`](Self::stop).
    pub async fn shutdown(&self) {
        let Some(Running {
            tx,
            shutdown,
            workers,
        }) = self.running.lock().take()
        else {
            return;
        };
        let _ = shutdown.send(true);
        drop(tx);
        for joined in join_all(workers).await {
            if let Err(e) = joined {
                tracing::error!("Async worker panicked: {e}");
            }
        }
    }

    /// Queues a task, blocking the calling thread while the queue is full.
    ///
    /// Meant for VM threads. Inside the runtime use [`submit`](Self::submit).
    pub fn add(&self, task: AsyncTask) -> Result<()> {
        let tx = self.sender()?;
        tx.blocking_send(task).map_err(|_| Error::PoolStopped)?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queues a task, waiting asynchronously while the queue is full.
    pub async fn submit(&self, task: AsyncTask) -> Result<()> {
        let tx = self.sender()?;
        tx.send(task).await.map_err(|_| Error::PoolStopped)?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sender(&self) -> Result<mpsc::Sender<AsyncTask>> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.tx.clone())
            .ok_or(Error::PoolStopped)
    }
}

impl Drop for AsyncPool {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown.send(true);
        }
    }
}

async fn worker(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<AsyncTask>>>,
    mut shutdown: watch::Receiver<bool>,
    timeout: Option<Duration>,
    finished: Arc<AtomicU64>,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            task = async { rx.lock().await.recv().await } => match task {
                Some(task) => task,
                None => break,
            },
        };

        // Once received, a task always runs to completion.
        if let Err(e) = task(TaskContext::new(timeout)).await {
            tracing::error!(worker = id, "Async task failed: {e}");
        }
        finished.fetch_add(1, Ordering::Relaxed);
    }
}
