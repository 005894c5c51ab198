//! Conveyor Dispatcher - Distributed Job Dispatcher
//!
//! Many dispatcher processes share one transactional store and cooperate
//! without a coordinator:
//! - Named queues with ordered pending jobs and queue-wide quota caps
//! - Agents with a size, an optional job filter and quota participation
//! - Claiming and result recording in optimistic transactions, retried on
//!   conflict with exponential backoff
//! - Heartbeats per queue registration; silent peers are declared dead and
//!   their jobs go back to the front of the queue
//! - Job callbacks, delayed jobs and cross-process annotations
//! - Poll history with statistics and per-job reports
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  Conveyor Dispatcher Process                  │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  Reactor thread                      Worker threads           │
//! │  ┌────────────────────────────┐      ┌────────────────────┐   │
//! │  │ activate / deactivate      │      │ JobRunner::run     │   │
//! │  │ poll cycle (every N secs)  │─────▶│  invoke callable   │   │
//! │  │  ping, prune, claim        │      │  commit result     │   │
//! │  │  death detection           │◀─────│  run callbacks     │   │
//! │  │ release finished jobs      │      └────────────────────┘   │
//! │  └─────────────┬──────────────┘                ▲              │
//! │                │                               │              │
//! │                ▼                               │              │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │                 Transactional Store                   │    │
//! │  │  queues ─ pending ─ quotas ─ registrations ─ jobs     │    │
//! │  │  annotations ─ poll history                           │    │
//! │  └──────────────────────────────────────────────────────┘    │
//! │                ▲                                              │
//! │                │ QueueClient::put                             │
//! │           Producers                                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use conveyor_dispatcher::prelude::*;
//! use std::sync::Arc;
//!
//! let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//! let reactor = Arc::new(TokioReactor::start(ReactorConfig::default())?);
//!
//! let callables = Arc::new(CallableRegistry::new());
//! callables.register("mul", |_ctx: &mut JobContext, args: &CallArgs| {
//!     Ok((args.i64(0)? * args.i64(1)?).into())
//! });
//!
//! let dispatcher = Dispatcher::builder()
//!     .store(store.clone())
//!     .reactor(reactor.clone())
//!     .callables(callables)
//!     .build()?;
//! dispatcher.start();
//!
//! let client = QueueClient::new(store);
//! let id = client.put("", CallSpec::new("mul").arg(14).arg(3))?;
//! let job = client.wait_for_completion(&id, Duration::from_secs(5), Duration::from_millis(50))?;
//! ```

pub mod agent;
pub mod annotation;
pub mod client;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod job;
pub mod metrics;
pub mod poll;
pub mod queue;
pub mod reactor;
pub mod registration;
pub mod retry;
pub mod status;
pub mod store;
pub mod worker;

pub use agent::{AgentRecord, FilterRegistry, DEFAULT_AGENT_NAME};
pub use annotation::{Annotations, DEFAULT_ANNOTATION_POLL};
pub use client::QueueClient;
pub use context::{CallArgs, Callable, CallableRegistry, JobContext};
pub use dispatcher::{Dispatcher, DispatcherBuilder, DispatcherSettings, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_RETENTION};
pub use error::{DispatchError, DispatchResult, StoreError, StoreResult};
pub use events::{DispatcherEvent, EventBus};
pub use job::{CallSpec, ClaimInfo, Failure, JobId, JobOutcome, JobRecord, JobStatus};
pub use metrics::{register_metrics, JobMetrics, PollMetrics, StoreMetrics};
pub use poll::{AgentPoll, PollHistory, PollKey, PollLookup, PollRecord, QueuePoll};
pub use queue::{Queue, QuotaTable, DEFAULT_QUEUE, DEFAULT_QUOTA_SIZE};
pub use reactor::{Reactor, ReactorConfig, Task, TokioReactor};
pub use registration::{DispatcherRegistration, DEFAULT_PING_DEATH_INTERVAL, DEFAULT_PING_INTERVAL};
pub use retry::{transact, RetryPolicy, RetryStrategy};
pub use status::{DispatcherStatus, JobInfo, JobTiming, Statistics, StatusInfo};
pub use store::{MemoryStore, Store, StoreKeys, Transaction, TransactionExt, DEFAULT_POOL_SIZE};
pub use worker::JobRunner;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::QueueClient;
    pub use crate::context::{CallArgs, CallableRegistry, JobContext};
    pub use crate::dispatcher::{Dispatcher, DispatcherSettings};
    pub use crate::job::{CallSpec, Failure, JobId, JobRecord, JobStatus};
    pub use crate::reactor::{Reactor, ReactorConfig, TokioReactor};
    pub use crate::store::{MemoryStore, Store};
    pub use crate::{DispatchError, DispatchResult};
}
