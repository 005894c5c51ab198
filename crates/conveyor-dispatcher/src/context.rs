//! Execution context handed to callables, and the callable registry.

use crate::annotation::{self, Annotations};
use crate::error::{DispatchError, DispatchResult};
use crate::job::{CallSpec, Failure, JobId, JobRecord};
use crate::queue::Queue;
use crate::reactor::panic_message;
use crate::retry::RetryPolicy;
use crate::store::{Store, StoreKeys, Transaction};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The job a worker is executing, with the transaction its result will be
/// committed in.
pub struct JobContext {
    job_id: JobId,
    queue: String,
    tx: Box<dyn Transaction>,
    store: Arc<dyn Store>,
    keys: StoreKeys,
    retry: RetryPolicy,
}

impl JobContext {
    /// Binds a job to the transaction it runs in.
    pub fn new(
        job_id: JobId,
        queue: impl Into<String>,
        tx: Box<dyn Transaction>,
        store: Arc<dyn Store>,
        keys: StoreKeys,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            job_id,
            queue: queue.into(),
            tx,
            store,
            keys,
            retry,
        }
    }

    /// ID of the running job.
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Name of the queue the job came from.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// The job's transaction. Writes commit together with the result.
    pub fn transaction(&mut self) -> &mut dyn Transaction {
        self.tx.as_mut()
    }

    /// Stages a new job in `queue`; it becomes visible when this job's
    /// result commits.
    pub fn enqueue(&mut self, queue: &str, call: CallSpec) -> DispatchResult<JobId> {
        self.enqueue_job(JobRecord::new(queue, call))
    }

    /// Stages a prepared job in its own queue.
    pub fn enqueue_job(&mut self, job: JobRecord) -> DispatchResult<JobId> {
        let queue = Queue::new(self.keys.clone(), job.queue.clone());
        let id = queue.put(self.tx.as_mut(), job)?;
        info!(parent_job_id = %self.job_id, job_id = %id, queue = %queue.name(), "Job handed off");
        Ok(id)
    }

    /// Annotations of the running job as committed so far.
    pub fn annotations(&self) -> DispatchResult<Annotations> {
        let mut tx = self.store.begin();
        let annotations = annotation::read_annotations(tx.as_mut(), &self.keys, &self.job_id);
        tx.abort();
        annotations
    }

    /// Publishes an annotation immediately, outside the job's transaction.
    pub fn set_live_annotation(&self, key: &str, value: Value) -> DispatchResult<()> {
        annotation::set_live(self.store.as_ref(), &self.keys, &self.retry, &self.job_id, key, value)
    }

    /// Blocks until another process sets `key` on this job or `timeout`
    /// elapses.
    pub fn get_live_annotation(&self, key: &str, timeout: Duration, poll: Duration) -> DispatchResult<Value> {
        annotation::get_live(self.store.as_ref(), &self.keys, &self.job_id, key, timeout, poll)
    }

    pub(crate) fn into_transaction(self) -> Box<dyn Transaction> {
        self.tx
    }
}

impl From<DispatchError> for Failure {
    fn from(err: DispatchError) -> Self {
        Failure::new(err.kind(), err.to_string())
    }
}

/// Arguments of one call, with typed accessors that fail like a call with
/// the wrong operand types would.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    /// Creates argument lists.
    pub fn new(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Inserts `value` as the first positional argument.
    pub fn with_leading(mut self, value: Value) -> Self {
        self.args.insert(0, value);
        self
    }

    /// Number of positional arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Returns true if there are no positional arguments.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Positional arguments.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Keyword argument by name.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Positional argument `index`.
    pub fn positional(&self, index: usize) -> Result<&Value, Failure> {
        self.args.get(index).ok_or_else(|| {
            Failure::type_error(format!(
                "missing positional argument {} (got {})",
                index,
                self.args.len()
            ))
        })
    }

    /// Positional argument `index` as an integer.
    pub fn i64(&self, index: usize) -> Result<i64, Failure> {
        let value = self.positional(index)?;
        value.as_i64().ok_or_else(|| wrong_type(index, "an integer", value))
    }

    /// Positional argument `index` as a number.
    pub fn f64(&self, index: usize) -> Result<f64, Failure> {
        let value = self.positional(index)?;
        value.as_f64().ok_or_else(|| wrong_type(index, "a number", value))
    }

    /// Positional argument `index` as a string.
    pub fn str(&self, index: usize) -> Result<&str, Failure> {
        let value = self.positional(index)?;
        value.as_str().ok_or_else(|| wrong_type(index, "a string", value))
    }

    /// Positional argument `index` as a boolean.
    pub fn bool(&self, index: usize) -> Result<bool, Failure> {
        let value = self.positional(index)?;
        value.as_bool().ok_or_else(|| wrong_type(index, "a boolean", value))
    }
}

impl From<&CallSpec> for CallArgs {
    fn from(call: &CallSpec) -> Self {
        Self::new(call.args.clone(), call.kwargs.clone())
    }
}

fn wrong_type(index: usize, expected: &str, value: &Value) -> Failure {
    Failure::type_error(format!(
        "argument {} must be {}, got {}",
        index,
        expected,
        type_name(value)
    ))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A registered job body.
pub type Callable = Arc<dyn Fn(&mut JobContext, &CallArgs) -> Result<Value, Failure> + Send + Sync>;

/// Callables by name. Jobs refer to callables by name only.
#[derive(Default)]
pub struct CallableRegistry {
    callables: RwLock<HashMap<String, Callable>>,
}

impl CallableRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callable, replacing any previous one with that name.
    pub fn register<F>(&self, name: impl Into<String>, callable: F)
    where
        F: Fn(&mut JobContext, &CallArgs) -> Result<Value, Failure> + Send + Sync + 'static,
    {
        let name = name.into();
        info!(callable = %name, "Registered callable");
        self.callables.write().insert(name, Arc::new(callable));
    }

    /// Returns true if a callable with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.callables.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.callables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Invokes a callable. Unknown names and panics become failures.
    pub fn invoke(&self, name: &str, ctx: &mut JobContext, args: &CallArgs) -> Result<Value, Failure> {
        let callable = self.callables.read().get(name).cloned();
        let Some(callable) = callable else {
            return Err(Failure::new(
                "UnknownCallable",
                format!("no callable registered as '{}'", name),
            ));
        };

        match catch_unwind(AssertUnwindSafe(|| callable(ctx, args))) {
            Ok(result) => result,
            Err(panic) => Err(Failure::new("Panic", panic_message(panic.as_ref()))),
        }
    }
}
