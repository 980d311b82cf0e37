//! The block model: the `Block` trait, the type registry, and the built-in
//! block implementations.
//!
//! A block is a long-running, event-driven computation with named input
//! ports and an output stream. The core treats block internals as opaque:
//! the supervisor drives [`Block::run`], and the dispatcher delivers
//! matched events through [`Block::handle`] keyed by port name. Handlers
//! are an explicit interface here — there is no reflective method lookup,
//! a block interprets its own port names.
//!
//! Outputs go through an [`OutputHandle`] captured at construction; the
//! handle stamps the `block.port` source onto every emitted event and
//! feeds the node's out-queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

use crate::config::BlockConfig;
use crate::dispatch::Event;
use crate::errors::{BlockError, ConfigError};

// ── Output handle ─────────────────────────────────────────────────────────────

/// A block's connection to the event fabric. Cloneable; sending never
/// blocks. If the dispatcher is gone (shutdown), emissions are dropped.
#[derive(Clone, Debug)]
pub struct OutputHandle {
    block: String,
    out_tx: mpsc::UnboundedSender<Event>,
}

impl OutputHandle {
    pub fn new(block: &str, out_tx: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            block: block.to_string(),
            out_tx,
        }
    }

    /// Emit on the default output port, which is named after the block
    /// itself (`b1` emits as `b1.b1`).
    pub fn emit(&self, data: Value) {
        let port = self.block.clone();
        self.emit_from(&port, data);
    }

    /// Emit on a named output port.
    pub fn emit_from(&self, port: &str, data: Value) {
        let event = Event {
            source: format!("{}.{}", self.block, port),
            data,
        };
        if self.out_tx.send(event).is_err() {
            debug!(block = %self.block, "Dropped emission, dispatcher stopped");
        }
    }
}

// ── Block trait ───────────────────────────────────────────────────────────────

impl std::fmt::Debug for dyn Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block").field("name", &self.name()).finish()
    }
}

/// A runnable block. Implementations are `Send + Sync` and internally
/// mutable — the supervisor and the dispatcher both hold the same `Arc`.
#[async_trait]
pub trait Block: Send + Sync {
    /// The globally unique block name from the configuration.
    fn name(&self) -> &str;

    /// The long-running body. The default parks until cancelled, which
    /// suits purely input-driven blocks. Implementations must return
    /// promptly once `cancel` observes `true`.
    async fn run(&self, cancel: watch::Receiver<bool>) -> Result<(), BlockError> {
        let mut cancel = cancel;
        loop {
            if *cancel.borrow() {
                return Ok(());
            }
            if cancel.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Receive a dispatched value. `port` is `None` when the wiring used a
    /// null port key, meaning the block's default input.
    async fn handle(&self, port: Option<&str>, data: Value) -> Result<(), BlockError> {
        let _ = (port, data);
        Ok(())
    }
}

// ── Typed parameter access ────────────────────────────────────────────────────

/// Typed view over a block's free-form config parameters.
pub struct BlockParams<'a> {
    block: &'a str,
    params: &'a HashMap<String, serde_yaml::Value>,
}

impl<'a> BlockParams<'a> {
    pub fn new(block: &'a str, params: &'a HashMap<String, serde_yaml::Value>) -> Self {
        Self { block, params }
    }

    fn bad(&self, param: &str, detail: &str) -> ConfigError {
        ConfigError::BadParameter {
            block: self.block.to_string(),
            param: param.to_string(),
            detail: detail.to_string(),
        }
    }

    /// Any parameter, transcoded to JSON.
    pub fn json(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        match self.params.get(key) {
            None => Ok(None),
            Some(value) => serde_json::to_value(value)
                .map(Some)
                .map_err(|e| self.bad(key, &e.to_string())),
        }
    }

    pub fn string(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.params.get(key) {
            None => Ok(None),
            Some(serde_yaml::Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.bad(key, "expected a string")),
        }
    }

    pub fn f64(&self, key: &str) -> Result<Option<f64>, ConfigError> {
        match self.params.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.bad(key, "expected a number")),
        }
    }

    /// A list of strings; absent means empty.
    pub fn string_list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        match self.params.get(key) {
            None => Ok(Vec::new()),
            Some(serde_yaml::Value::Sequence(seq)) => seq
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| self.bad(key, "list entries must be strings"))
                })
                .collect(),
            Some(_) => Err(self.bad(key, "expected a list of strings")),
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

type Factory =
    Box<dyn Fn(&str, &BlockConfig, OutputHandle) -> Result<Arc<dyn Block>, ConfigError> + Send + Sync>;

/// Maps config `type` tags to block constructors. The built-in set covers
/// the simple timer/logic/value blocks; richer block libraries register
/// their own types here before startup.
pub struct BlockRegistry {
    factories: HashMap<String, Factory>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with every built-in type registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("constant", |name, config, out| {
            Ok(Arc::new(Constant::from_config(name, config, out)?) as Arc<dyn Block>)
        });
        registry.register("logger", |name, config, _out| {
            Ok(Arc::new(Logger::from_config(name, config)?) as Arc<dyn Block>)
        });
        registry.register("value", |name, config, out| {
            Ok(Arc::new(ValueBlock::from_config(name, config, out)?) as Arc<dyn Block>)
        });
        registry.register("and", |name, config, out| {
            Ok(Arc::new(LogicGate::from_config(name, config, out, GateOp::And)?) as Arc<dyn Block>)
        });
        registry.register("or", |name, config, out| {
            Ok(Arc::new(LogicGate::from_config(name, config, out, GateOp::Or)?) as Arc<dyn Block>)
        });
        registry.register("not", |name, config, out| {
            Ok(Arc::new(LogicGate::from_config(name, config, out, GateOp::Not)?) as Arc<dyn Block>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&str, &BlockConfig, OutputHandle) -> Result<Arc<dyn Block>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    pub fn build(
        &self,
        name: &str,
        config: &BlockConfig,
        out: OutputHandle,
    ) -> Result<Arc<dyn Block>, ConfigError> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| ConfigError::UnknownBlockType {
                block: name.to_string(),
                kind: config.kind.clone(),
            })?;
        factory(name, config, out)
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ── Built-in: constant ────────────────────────────────────────────────────────

/// Emits a fixed value on a fixed interval.
///
/// Parameters: `data` (any JSON value, default null), `interval` (seconds,
/// default 1).
pub struct Constant {
    name: String,
    data: Value,
    interval: Duration,
    out: OutputHandle,
}

impl Constant {
    pub fn from_config(
        name: &str,
        config: &BlockConfig,
        out: OutputHandle,
    ) -> Result<Self, ConfigError> {
        let params = BlockParams::new(name, &config.params);
        let data = params.json("data")?.unwrap_or(Value::Null);
        let interval = params.f64("interval")?.unwrap_or(1.0);
        if !interval.is_finite() || interval <= 0.0 {
            return Err(ConfigError::BadParameter {
                block: name.to_string(),
                param: "interval".to_string(),
                detail: "must be a positive number of seconds".to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            data,
            interval: Duration::from_secs_f64(interval),
            out,
        })
    }
}

#[async_trait]
impl Block for Constant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: watch::Receiver<bool>) -> Result<(), BlockError> {
        let mut cancel = cancel;
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.out.emit(self.data.clone());
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

// ── Built-in: logger ──────────────────────────────────────────────────────────

/// Logs every received value at info level.
///
/// Parameters: `prefix` (optional string prepended to the log line).
pub struct Logger {
    name: String,
    prefix: Option<String>,
}

impl Logger {
    pub fn from_config(name: &str, config: &BlockConfig) -> Result<Self, ConfigError> {
        let params = BlockParams::new(name, &config.params);
        Ok(Self {
            name: name.to_string(),
            prefix: params.string("prefix")?,
        })
    }
}

#[async_trait]
impl Block for Logger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, port: Option<&str>, data: Value) -> Result<(), BlockError> {
        info!(
            block = %self.name,
            port = port.unwrap_or("-"),
            prefix = self.prefix.as_deref().unwrap_or(""),
            data = %data,
            "Received value"
        );
        Ok(())
    }
}

// ── Built-in: value ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum ValueKind {
    Int,
    Float,
    Str,
    Bool,
    Json,
}

impl ValueKind {
    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "int" => Some(ValueKind::Int),
            "float" => Some(ValueKind::Float),
            "str" => Some(ValueKind::Str),
            "bool" => Some(ValueKind::Bool),
            "json" => Some(ValueKind::Json),
            _ => None,
        }
    }
}

/// Stores the latest received value, coerced to a declared kind, and
/// re-emits it on change of input.
///
/// Parameters: `kind` (int/float/str/bool/json, default str), `initial`.
pub struct ValueBlock {
    name: String,
    kind: ValueKind,
    value: Mutex<Option<Value>>,
    out: OutputHandle,
}

impl ValueBlock {
    pub fn from_config(
        name: &str,
        config: &BlockConfig,
        out: OutputHandle,
    ) -> Result<Self, ConfigError> {
        let params = BlockParams::new(name, &config.params);
        let kind_str = params.string("kind")?.unwrap_or_else(|| "str".to_string());
        let kind = ValueKind::parse(&kind_str).ok_or_else(|| ConfigError::BadParameter {
            block: name.to_string(),
            param: "kind".to_string(),
            detail: format!("invalid kind '{}'", kind_str),
        })?;
        Ok(Self {
            name: name.to_string(),
            kind,
            value: Mutex::new(params.json("initial")?),
            out,
        })
    }

    fn coerce(&self, data: &Value) -> Result<Value, BlockError> {
        let fail = || BlockError::BadValue(format!("cannot coerce {} to {:?}", data, self.kind));
        match self.kind {
            ValueKind::Int => {
                let n = match data {
                    Value::Number(n) => n.as_f64().ok_or_else(fail)? as i64,
                    Value::String(s) => s.trim().parse::<i64>().map_err(|_| fail())?,
                    Value::Bool(b) => *b as i64,
                    _ => return Err(fail()),
                };
                Ok(Value::from(n))
            }
            ValueKind::Float => {
                let n = match data {
                    Value::Number(n) => n.as_f64().ok_or_else(fail)?,
                    Value::String(s) => s.trim().parse::<f64>().map_err(|_| fail())?,
                    _ => return Err(fail()),
                };
                Ok(Value::from(n))
            }
            ValueKind::Str => Ok(Value::from(match data {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
            ValueKind::Bool => Ok(Value::from(truthy(data))),
            ValueKind::Json => match data {
                Value::String(s) => serde_json::from_str(s).map_err(|_| fail()),
                other => Ok(other.clone()),
            },
        }
    }

    /// The current stored value, for tests and status rendering.
    pub async fn current(&self) -> Option<Value> {
        self.value.lock().await.clone()
    }
}

#[async_trait]
impl Block for ValueBlock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, port: Option<&str>, data: Value) -> Result<(), BlockError> {
        match port {
            None | Some("value") => {
                let coerced = self.coerce(&data)?;
                *self.value.lock().await = Some(coerced.clone());
                debug!(block = %self.name, value = %coerced, "Value updated");
                self.out.emit(coerced);
                Ok(())
            }
            Some(other) => Err(BlockError::UnknownPort(other.to_string())),
        }
    }
}

// ── Built-in: logic gates ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateOp {
    And,
    Or,
    Not,
}

#[derive(Debug)]
struct GateState {
    inputs: BTreeMap<String, bool>,
    last: Option<bool>,
}

/// Boolean gate over named input ports. Recomputes on every input and
/// emits only when the computed value changes.
///
/// Parameters: `parameters` (list of accepted port names; when omitted,
/// any port is accepted as it first appears — `not` requires exactly one
/// declared parameter).
#[derive(Debug)]
pub struct LogicGate {
    name: String,
    op: GateOp,
    declared: Option<Vec<String>>,
    state: Mutex<GateState>,
    out: OutputHandle,
}

impl LogicGate {
    pub fn from_config(
        name: &str,
        config: &BlockConfig,
        out: OutputHandle,
        op: GateOp,
    ) -> Result<Self, ConfigError> {
        let params = BlockParams::new(name, &config.params);
        let declared = params.string_list("parameters")?;
        if op == GateOp::Not && declared.len() != 1 {
            return Err(ConfigError::BadParameter {
                block: name.to_string(),
                param: "parameters".to_string(),
                detail: "'not' takes exactly one parameter".to_string(),
            });
        }
        let inputs: BTreeMap<String, bool> =
            declared.iter().map(|p| (p.clone(), false)).collect();
        Ok(Self {
            name: name.to_string(),
            op,
            declared: if declared.is_empty() {
                None
            } else {
                Some(declared)
            },
            state: Mutex::new(GateState {
                inputs,
                last: None,
            }),
            out,
        })
    }

    fn compute(&self, inputs: &BTreeMap<String, bool>) -> bool {
        match self.op {
            GateOp::And => !inputs.is_empty() && inputs.values().all(|v| *v),
            GateOp::Or => inputs.values().any(|v| *v),
            GateOp::Not => !inputs.values().next().copied().unwrap_or(false),
        }
    }
}

#[async_trait]
impl Block for LogicGate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, port: Option<&str>, data: Value) -> Result<(), BlockError> {
        let port = port.ok_or_else(|| BlockError::UnknownPort("<default>".to_string()))?;
        if let Some(declared) = &self.declared {
            if !declared.iter().any(|p| p == port) {
                return Err(BlockError::UnknownPort(port.to_string()));
            }
        }

        let mut state = self.state.lock().await;
        state.inputs.insert(port.to_string(), truthy(&data));
        let value = self.compute(&state.inputs);
        if state.last != Some(value) {
            state.last = Some(value);
            debug!(block = %self.name, value, "Gate output changed");
            self.out.emit(Value::from(value));
        }
        Ok(())
    }
}

/// JSON truthiness: null and empty containers are false, numbers compare
/// against zero.
fn truthy(data: &Value) -> bool {
    match data {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
