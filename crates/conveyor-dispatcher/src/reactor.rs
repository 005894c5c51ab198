//! Scheduler the dispatcher is hosted on.
//!
//! A reactor owns one scheduling thread that runs timers and short tasks
//! in order, plus a bounded pool of worker threads for job bodies. The
//! dispatcher only touches its scheduling state from the reactor thread
//! and hands work across with [`Reactor::call_from_thread`] and
//! [`Reactor::call_in_thread`].

use crate::error::{DispatchError, DispatchResult};
use conveyor_config::DispatcherConfig;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// A unit of work handed to the reactor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling primitives required by the dispatcher.
pub trait Reactor: Send + Sync {
    /// Runs `task` on the reactor thread as soon as possible. Any thread.
    fn call_from_thread(&self, task: Task) -> DispatchResult<()>;

    /// Runs `task` on a worker thread as soon as possible.
    fn call_in_thread(&self, task: Task) -> DispatchResult<()>;

    /// Runs `task` on the reactor thread after `delay`.
    fn call_later(&self, delay: Duration, task: Task) -> DispatchResult<()>;

    /// Registers a hook that runs once on the reactor thread before it stops.
    fn add_before_shutdown(&self, task: Task);

    /// Runs `task` on the reactor thread once the reactor is running.
    fn when_running(&self, task: Task);

    /// Returns true when called on the reactor thread.
    fn in_reactor_thread(&self) -> bool;
}

/// Reactor configuration.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Upper bound on worker threads.
    pub worker_threads: usize,
    /// Time given to worker threads after the loop exits.
    pub shutdown_timeout: Duration,
    /// Name of the reactor thread; workers get a `-worker` suffix.
    pub thread_name: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            worker_threads: 16,
            shutdown_timeout: Duration::from_secs(30),
            thread_name: "conveyor-reactor".to_string(),
        }
    }
}

impl From<&DispatcherConfig> for ReactorConfig {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            worker_threads: config.worker_threads,
            shutdown_timeout: config.shutdown_timeout(),
            ..Self::default()
        }
    }
}

enum Command {
    Run(Task),
    Later(Duration, Task),
    Spawn(Task),
    Shutdown,
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    running: AtomicBool,
    thread_id: OnceLock<ThreadId>,
    before_shutdown: Mutex<Vec<Task>>,
    /// Tasks deferred until the loop starts; `None` once it has.
    when_running: Mutex<Option<Vec<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn send(&self, command: Command) -> DispatchResult<()> {
        self.commands
            .send(command)
            .map_err(|_| DispatchError::Reactor("reactor is stopped".to_string()))
    }

    async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<Command>) {
        let deferred = self.when_running.lock().take().unwrap_or_default();
        self.running.store(true, Ordering::Release);
        for task in deferred {
            run_task("when_running", task);
        }

        while let Some(command) = commands.recv().await {
            match command {
                Command::Run(task) => run_task("call_from_thread", task),
                Command::Later(delay, task) => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        run_task("call_later", task);
                    });
                }
                Command::Spawn(task) => {
                    tokio::task::spawn_blocking(move || run_task("call_in_thread", task));
                }
                Command::Shutdown => {
                    debug!("Reactor running before-shutdown hooks");
                    let hooks = std::mem::take(&mut *self.before_shutdown.lock());
                    for hook in hooks {
                        run_task("before_shutdown", hook);
                    }
                    self.running.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }
}

/// A panicking task is logged and must not take the reactor down.
fn run_task(kind: &'static str, task: Task) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
        error!(task = kind, panic = %panic_message(panic.as_ref()), "Reactor task panicked");
    }
}

/// Extracts the message of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Reactor backed by a current-thread tokio runtime on a dedicated thread.
///
/// Worker threads come from the runtime's blocking pool, capped at
/// `worker_threads`.
pub struct TokioReactor {
    inner: Arc<Inner>,
}

impl TokioReactor {
    /// Builds the runtime and starts the reactor thread.
    pub fn start(config: ReactorConfig) -> DispatchResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .max_blocking_threads(config.worker_threads.max(1))
            .thread_name(format!("{}-worker", config.thread_name))
            .build()
            .map_err(|e| DispatchError::Reactor(format!("Failed to build runtime: {}", e)))?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            commands,
            running: AtomicBool::new(false),
            thread_id: OnceLock::new(),
            before_shutdown: Mutex::new(Vec::new()),
            when_running: Mutex::new(Some(Vec::new())),
            thread: Mutex::new(None),
        });

        let loop_inner = Arc::clone(&inner);
        let shutdown_timeout = config.shutdown_timeout;
        let handle = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                let _ = loop_inner.thread_id.set(std::thread::current().id());
                runtime.block_on(Arc::clone(&loop_inner).run(receiver));
                runtime.shutdown_timeout(shutdown_timeout);
            })
            .map_err(|e| DispatchError::Reactor(format!("Failed to spawn reactor thread: {}", e)))?;

        *inner.thread.lock() = Some(handle);

        info!(
            thread = %config.thread_name,
            worker_threads = config.worker_threads,
            "Reactor started"
        );

        Ok(Self { inner })
    }

    /// Returns true while the loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Runs the before-shutdown hooks and stops the reactor, waiting for
    /// the reactor thread to exit. Idempotent.
    pub fn stop(&self) -> DispatchResult<()> {
        if self.in_reactor_thread() {
            return Err(DispatchError::Reactor(
                "stop must not be called from the reactor thread".to_string(),
            ));
        }

        let Some(handle) = self.inner.thread.lock().take() else {
            return Ok(());
        };

        info!("Stopping reactor");
        // A closed channel means the loop already exited
        let _ = self.inner.send(Command::Shutdown);
        handle
            .join()
            .map_err(|_| DispatchError::Reactor("reactor thread panicked".to_string()))?;
        info!("Reactor stopped");
        Ok(())
    }
}

impl Reactor for TokioReactor {
    fn call_from_thread(&self, task: Task) -> DispatchResult<()> {
        self.inner.send(Command::Run(task))
    }

    fn call_in_thread(&self, task: Task) -> DispatchResult<()> {
        self.inner.send(Command::Spawn(task))
    }

    fn call_later(&self, delay: Duration, task: Task) -> DispatchResult<()> {
        self.inner.send(Command::Later(delay, task))
    }

    fn add_before_shutdown(&self, task: Task) {
        self.inner.before_shutdown.lock().push(task);
    }

    fn when_running(&self, task: Task) {
        let mut deferred = self.inner.when_running.lock();
        match deferred.as_mut() {
            Some(tasks) => tasks.push(task),
            None => {
                drop(deferred);
                if let Err(e) = self.inner.send(Command::Run(task)) {
                    error!(error = %e, "Dropping when_running task");
                }
            }
        }
    }

    fn in_reactor_thread(&self) -> bool {
        self.inner.thread_id.get() == Some(&std::thread::current().id())
    }
}

impl Drop for TokioReactor {
    fn drop(&mut self) {
        if self.in_reactor_thread() {
            let _ = self.inner.send(Command::Shutdown);
        } else if let Err(e) = self.stop() {
            error!(error = %e, "Reactor did not stop cleanly");
        }
    }
}
