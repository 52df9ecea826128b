//! Task functions and the function registry.
//!
//! Task bodies are not transported between processes. A task node names a
//! function, and every executor resolves that name in a [`FunctionRegistry`]
//! built once at process start.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Arguments passed to a task function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    /// Positional arguments, in edge order.
    pub args: Vec<JsonValue>,
    /// Keyword arguments.
    pub kwargs: BTreeMap<String, JsonValue>,
}

impl CallArgs {
    /// Creates arguments from positional values only.
    #[must_use]
    pub fn positional(args: Vec<JsonValue>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    /// Returns a positional argument.
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&JsonValue> {
        self.args.get(index)
    }

    /// Returns a keyword argument.
    #[must_use]
    pub fn kwarg(&self, name: &str) -> Option<&JsonValue> {
        self.kwargs.get(name)
    }

    /// Returns all argument values, positional first, then keywords by name.
    pub fn values(&self) -> impl Iterator<Item = &JsonValue> {
        self.args.iter().chain(self.kwargs.values())
    }
}

/// Standard output and error captured for one task invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Streams {
    pub stdout: String,
    pub stderr: String,
}

impl Streams {
    /// Appends a line to standard output.
    pub fn out(&mut self, line: impl AsRef<str>) {
        self.stdout.push_str(line.as_ref());
        self.stdout.push('\n');
    }

    /// Appends a line to standard error.
    pub fn err(&mut self, line: impl AsRef<str>) {
        self.stderr.push_str(line.as_ref());
        self.stderr.push('\n');
    }
}

/// A task body.
///
/// `call` runs on a blocking thread. An `Err` is the task's own failure
/// message; the executor reports it as a task runtime error.
pub trait TaskFunction: Send + Sync {
    /// Evaluates the function.
    fn call(&self, args: &CallArgs, streams: &mut Streams) -> Result<JsonValue, String>;
}

impl<F> TaskFunction for F
where
    F: Fn(&CallArgs, &mut Streams) -> Result<JsonValue, String> + Send + Sync,
{
    fn call(&self, args: &CallArgs, streams: &mut Streams) -> Result<JsonValue, String> {
        self(args, streams)
    }
}

/// Named task functions available to executors.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn TaskFunction>>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in functions:
    /// `identity`, `add`, `multiply`, `sum`, `concat`, `sleep` and `fail`.
    #[must_use]
    pub fn with_builtins() -> Self {
        Self::new()
            .with("identity", identity)
            .with("add", add)
            .with("multiply", multiply)
            .with("sum", sum)
            .with("concat", concat)
            .with("sleep", sleep)
            .with("fail", fail)
    }

    /// Registers a function, replacing any previous one with that name.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, function: impl TaskFunction + 'static) -> Self {
        self.register(name, function);
        self
    }

    /// Registers a function, replacing any previous one with that name.
    pub fn register(&mut self, name: impl Into<String>, function: impl TaskFunction + 'static) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Looks up a function.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskFunction>> {
        self.functions.get(name).cloned()
    }

    /// Returns the registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

/// Returns the first positional argument, or the `value` keyword.
fn identity(args: &CallArgs, _streams: &mut Streams) -> Result<JsonValue, String> {
    Ok(args
        .arg(0)
        .or_else(|| args.kwarg("value"))
        .cloned()
        .unwrap_or(JsonValue::Null))
}

fn add(args: &CallArgs, _streams: &mut Streams) -> Result<JsonValue, String> {
    fold_numbers(args.values(), 0, i64::checked_add, 0.0, |a, b| a + b)
}

fn multiply(args: &CallArgs, _streams: &mut Streams) -> Result<JsonValue, String> {
    fold_numbers(args.values(), 1, i64::checked_mul, 1.0, |a, b| a * b)
}

/// Sums a single list argument, or all positional arguments.
fn sum(args: &CallArgs, _streams: &mut Streams) -> Result<JsonValue, String> {
    match args.args.as_slice() {
        [JsonValue::Array(items)] => fold_numbers(items.iter(), 0, i64::checked_add, 0.0, |a, b| a + b),
        values => fold_numbers(values.iter(), 0, i64::checked_add, 0.0, |a, b| a + b),
    }
}

/// Joins positional arguments with the `sep` keyword (default empty).
fn concat(args: &CallArgs, _streams: &mut Streams) -> Result<JsonValue, String> {
    let sep = match args.kwarg("sep") {
        None => "",
        Some(JsonValue::String(sep)) => sep.as_str(),
        Some(other) => return Err(format!("sep must be a string, got {other}")),
    };
    let parts: Vec<String> = args
        .args
        .iter()
        .map(|value| match value {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    Ok(JsonValue::String(parts.join(sep)))
}

/// Sleeps for the `ms` keyword (or first positional) milliseconds and
/// returns the `value` keyword.
fn sleep(args: &CallArgs, streams: &mut Streams) -> Result<JsonValue, String> {
    let ms = args
        .kwarg("ms")
        .or_else(|| args.arg(0))
        .and_then(JsonValue::as_u64)
        .ok_or_else(|| "sleep needs a non-negative integer duration in ms".to_string())?;
    std::thread::sleep(Duration::from_millis(ms));
    streams.out(format!("slept {ms}ms"));
    Ok(args.kwarg("value").cloned().unwrap_or(JsonValue::Null))
}

/// Always fails, with the first argument as the message when it is a string.
fn fail(args: &CallArgs, streams: &mut Streams) -> Result<JsonValue, String> {
    let message = args
        .arg(0)
        .and_then(JsonValue::as_str)
        .unwrap_or("task failed")
        .to_string();
    streams.err(&message);
    Err(message)
}

/// Folds numeric arguments, staying in integers while every input is one.
fn fold_numbers<'a>(
    values: impl Iterator<Item = &'a JsonValue>,
    int_init: i64,
    int_op: fn(i64, i64) -> Option<i64>,
    float_init: f64,
    float_op: fn(f64, f64) -> f64,
) -> Result<JsonValue, String> {
    let numbers = values
        .map(|value| match value {
            JsonValue::Number(n) => Ok(n),
            other => Err(format!("expected a number, got {other}")),
        })
        .collect::<Result<Vec<&Number>, _>>()?;

    if numbers.iter().all(|n| n.is_i64()) {
        let mut acc = int_init;
        for n in numbers.iter().filter_map(|n| n.as_i64()) {
            acc = int_op(acc, n).ok_or_else(|| "integer overflow".to_string())?;
        }
        return Ok(JsonValue::from(acc));
    }

    let acc = numbers
        .iter()
        .filter_map(|n| n.as_f64())
        .fold(float_init, float_op);
    Number::from_f64(acc)
        .map(JsonValue::Number)
        .ok_or_else(|| format!("result {acc} is not a finite number"))
}
