//! Callables every conveyor process provides.

use conveyor_dispatcher::{CallArgs, CallableRegistry, Failure, JobContext};
use serde_json::{json, Value};
use std::time::Duration;

/// Longest sleep the `sleep` callable accepts.
const MAX_SLEEP: Duration = Duration::from_secs(3600);

/// Registers the built-in callables.
pub fn register_builtin(registry: &CallableRegistry) {
    registry.register("echo", echo);
    registry.register("add", add);
    registry.register("mul", mul);
    registry.register("sleep", sleep);
    registry.register("progress", progress);
}

/// Returns its first argument.
fn echo(_: &mut JobContext, args: &CallArgs) -> Result<Value, Failure> {
    Ok(args.positional(0)?.clone())
}

/// Sums every positional argument.
fn add(_: &mut JobContext, args: &CallArgs) -> Result<Value, Failure> {
    let mut total = 0.0;
    for index in 0..args.len() {
        total += args.f64(index)?;
    }
    Ok(json!(total))
}

/// Multiplies two integers.
fn mul(_: &mut JobContext, args: &CallArgs) -> Result<Value, Failure> {
    let product = args
        .i64(0)?
        .checked_mul(args.i64(1)?)
        .ok_or_else(|| Failure::value_error("integer overflow"))?;
    Ok(json!(product))
}

/// Sleeps for the given number of seconds.
fn sleep(_: &mut JobContext, args: &CallArgs) -> Result<Value, Failure> {
    let secs = args.f64(0)?;
    let duration = Duration::try_from_secs_f64(secs)
        .map_err(|e| Failure::value_error(format!("invalid duration {}: {}", secs, e)))?;
    if duration > MAX_SLEEP {
        return Err(Failure::value_error(format!("sleep of {}s exceeds {:?}", secs, MAX_SLEEP)));
    }
    std::thread::sleep(duration);
    Ok(Value::Null)
}

/// Works through `steps` steps, publishing a live `progress` annotation
/// after each one.
fn progress(ctx: &mut JobContext, args: &CallArgs) -> Result<Value, Failure> {
    let steps = args.i64(0)?;
    if steps <= 0 {
        return Err(Failure::value_error("steps must be positive"));
    }
    let pause = args
        .kwarg("pause_ms")
        .and_then(Value::as_u64)
        .map_or(Duration::ZERO, Duration::from_millis);

    for step in 1..=steps {
        std::thread::sleep(pause);
        ctx.set_live_annotation("progress", json!(step as f64 / steps as f64))?;
    }
    Ok(json!(steps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_dispatcher::{CallSpec, JobId, MemoryStore, RetryPolicy, Store, StoreKeys};
    use std::sync::Arc;

    fn run(name: &str, call: CallSpec) -> Result<Value, Failure> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let registry = CallableRegistry::new();
        register_builtin(&registry);

        let mut ctx = JobContext::new(
            JobId::from("test"),
            "",
            store.begin(),
            store.clone(),
            StoreKeys::default(),
            RetryPolicy::none(),
        );
        registry.invoke(name, &mut ctx, &CallArgs::from(&call))
    }

    #[test]
    fn test_builtin_names() {
        let registry = CallableRegistry::new();
        register_builtin(&registry);
        assert_eq!(registry.names(), vec!["add", "echo", "mul", "progress", "sleep"]);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run("mul", CallSpec::new("mul").arg(14).arg(3)).unwrap(), json!(42));
        assert_eq!(run("add", CallSpec::new("add").arg(1).arg(2.5)).unwrap(), json!(3.5));
        assert_eq!(
            run("mul", CallSpec::new("mul").arg(14).arg(Value::Null)).unwrap_err().kind,
            "TypeError"
        );
        assert_eq!(
            run("mul", CallSpec::new("mul").arg(i64::MAX).arg(2)).unwrap_err().kind,
            "ValueError"
        );
    }

    #[test]
    fn test_sleep_rejects_bad_durations() {
        assert_eq!(run("sleep", CallSpec::new("sleep").arg(-1.0)).unwrap_err().kind, "ValueError");
        assert_eq!(run("sleep", CallSpec::new("sleep").arg(1e9)).unwrap_err().kind, "ValueError");
        assert_eq!(run("sleep", CallSpec::new("sleep").arg(0)).unwrap(), Value::Null);
    }

    #[test]
    fn test_progress_publishes_annotation() {
        assert_eq!(run("progress", CallSpec::new("progress").arg(4)).unwrap(), json!(4));
        assert_eq!(run("progress", CallSpec::new("progress").arg(0)).unwrap_err().kind, "ValueError");
    }
}
