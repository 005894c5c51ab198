//! Common test infrastructure for dispatcher integration tests.

#![allow(dead_code)]

use conveyor_dispatcher::{
    CallArgs, CallSpec, CallableRegistry, Dispatcher, DispatcherEvent, DispatcherSettings, Failure, JobContext,
    JobId, MemoryStore, QueueClient, ReactorConfig, RetryPolicy, Store, TokioReactor,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

/// How long tests wait for a job before giving up.
pub const JOB_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between completion checks.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Settings tuned for fast tests.
pub fn fast_settings() -> DispatcherSettings {
    DispatcherSettings::new(Uuid::new_v4())
        .with_poll_interval(Duration::from_millis(20))
        .with_ping_intervals(Duration::from_secs(1), Duration::from_secs(2))
        .with_poll_retention(Duration::from_secs(3600))
        .with_retry(RetryPolicy::exponential(10).with_initial_delay(Duration::from_millis(1)))
}

/// Callables used across the integration tests.
pub fn test_callables() -> Arc<CallableRegistry> {
    let callables = CallableRegistry::new();

    callables.register("mul", |_: &mut JobContext, args: &CallArgs| {
        Ok(json!(args.i64(0)? * args.i64(1)?))
    });

    callables.register("echo", |_: &mut JobContext, args: &CallArgs| {
        Ok(args.positional(0)?.clone())
    });

    callables.register("fail", |_: &mut JobContext, _: &CallArgs| -> Result<Value, Failure> {
        Err(Failure::value_error("boom"))
    });

    callables.register("sleep", |_: &mut JobContext, args: &CallArgs| {
        let millis = u64::try_from(args.i64(0)?).map_err(|_| Failure::value_error("negative sleep"))?;
        std::thread::sleep(Duration::from_millis(millis));
        Ok(Value::Null)
    });

    // Publishes "hello" then waits for a "reply" annotation
    callables.register("handshake", |ctx: &mut JobContext, args: &CallArgs| {
        let timeout = args
            .kwarg("timeout_ms")
            .and_then(Value::as_u64)
            .map_or(Duration::from_secs(5), Duration::from_millis);
        ctx.set_live_annotation("hello", json!("world"))?;
        let reply = ctx.get_live_annotation("reply", timeout, Duration::from_millis(5))?;
        Ok(reply)
    });

    callables.register("spawn_child", |ctx: &mut JobContext, args: &CallArgs| {
        let queue = ctx.queue_name().to_string();
        let child = ctx.enqueue(&queue, CallSpec::new("mul").arg(args.i64(0)?).arg(args.i64(1)?))?;
        Ok(json!(child.as_str()))
    });

    Arc::new(callables)
}

/// A dispatcher over an in-memory store, hosted on its own reactor.
pub struct TestDispatcher {
    pub store: Arc<MemoryStore>,
    pub reactor: Arc<TokioReactor>,
    pub dispatcher: Dispatcher,
    pub client: QueueClient,
}

impl TestDispatcher {
    /// Creates a stopped dispatcher with fast settings.
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    /// Creates a stopped dispatcher with the given settings.
    pub fn with_settings(settings: DispatcherSettings) -> Self {
        Self::on_store(Arc::new(MemoryStore::new()), settings)
    }

    /// Creates a stopped dispatcher sharing `store`.
    pub fn on_store(store: Arc<MemoryStore>, settings: DispatcherSettings) -> Self {
        let reactor = Arc::new(
            TokioReactor::start(ReactorConfig {
                worker_threads: 8,
                shutdown_timeout: Duration::from_secs(5),
                thread_name: "test-reactor".to_string(),
            })
            .expect("Failed to start reactor"),
        );
        let shared: Arc<dyn Store> = store.clone();

        let dispatcher = Dispatcher::builder()
            .store(shared.clone())
            .reactor(reactor.clone())
            .settings(settings)
            .callables(test_callables())
            .build()
            .expect("Failed to build dispatcher");

        Self {
            store,
            reactor,
            dispatcher,
            client: QueueClient::new(shared),
        }
    }

    /// Creates and activates a dispatcher with fast settings.
    pub fn running() -> Self {
        let fixture = Self::new();
        fixture.dispatcher.activate().expect("Failed to activate dispatcher");
        fixture
    }

    /// Enqueues a call in the default queue.
    pub fn put(&self, call: CallSpec) -> JobId {
        self.client.put("", call).expect("Failed to enqueue job")
    }
}

impl Drop for TestDispatcher {
    fn drop(&mut self) {
        let _ = self.dispatcher.deactivate();
        let _ = self.reactor.stop();
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(CHECK_INTERVAL);
    }
    condition()
}

/// Waits for the first event matching `predicate`.
pub fn wait_for_event(
    events: &mut broadcast::Receiver<DispatcherEvent>,
    timeout: Duration,
    mut predicate: impl FnMut(&DispatcherEvent) -> bool,
) -> Option<DispatcherEvent> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match events.try_recv() {
            Ok(event) if predicate(&event) => return Some(event),
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Empty) => std::thread::sleep(CHECK_INTERVAL),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(broadcast::error::TryRecvError::Closed) => return None,
        }
    }
    None
}
