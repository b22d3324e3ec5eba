//! Sandboxed rhai expressions used by map, filter, scan and the projecting
//! stages.
//!
//! An expression is compiled once per stage. Scripts see the current value
//! as `value` and its position as `index` (scan also gets `acc`); projecting
//! stages return `pipeline(0)` or `pipeline("name")` to pick one of their
//! nested pipelines. Evaluation failures, `throw` included, come back as
//! plain messages which the calling stage turns into an error value.

use marblecore::{Element, ElementId, GraphError, Value};
use marbleruntime::ResolvedPipeline;
use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Scope, AST, FLOAT, INT};
use std::fmt;
use std::sync::Arc;

/// Safety limits for expression evaluation
#[derive(Debug, Clone)]
pub struct ExpressionLimits {
    pub max_operations: u64,
    pub max_expr_depth: usize,
    pub max_function_expr_depth: usize,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for ExpressionLimits {
    fn default() -> Self {
        Self {
            max_operations: 10_000,
            max_expr_depth: 64,
            max_function_expr_depth: 64,
            max_call_levels: 32,
            max_string_size: 10_000,
            max_array_size: 1_000,
            max_map_size: 1_000,
        }
    }
}

/// Selects one of a stage's nested pipelines, by position or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineRef {
    Index(usize),
    Name(String),
}

impl PipelineRef {
    pub fn resolve<'a>(&self, pipelines: &'a [ResolvedPipeline]) -> Option<&'a ResolvedPipeline> {
        match self {
            PipelineRef::Index(index) => pipelines.get(*index),
            PipelineRef::Name(name) => pipelines.iter().find(|p| p.name() == Some(name.as_str())),
        }
    }
}

impl fmt::Display for PipelineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineRef::Index(index) => write!(f, "#{index}"),
            PipelineRef::Name(name) => f.write_str(name),
        }
    }
}

/// A compiled stage expression
#[derive(Clone)]
pub struct Expression {
    element_id: ElementId,
    engine: Arc<Engine>,
    ast: Arc<AST>,
}

impl Expression {
    pub fn compile(
        element: &Element,
        source: &str,
        limits: &ExpressionLimits,
    ) -> Result<Self, GraphError> {
        let engine = Self::engine(limits);
        let ast = engine.compile(source).map_err(|e| GraphError::Expression {
            element_id: element.id.clone(),
            message: e.to_string(),
        })?;
        tracing::debug!(stage = %element.id, "expression compiled");

        Ok(Self {
            element_id: element.id.clone(),
            engine: Arc::new(engine),
            ast: Arc::new(ast),
        })
    }

    fn engine(limits: &ExpressionLimits) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_expr_depths(limits.max_expr_depth, limits.max_function_expr_depth);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_operations(limits.max_operations);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);
        engine.disable_symbol("eval");
        engine.on_print(|text| tracing::debug!(target: "marbleops::script", "{text}"));
        engine.on_debug(|text, _, _| tracing::debug!(target: "marbleops::script", "{text}"));

        engine.register_type_with_name::<PipelineRef>("PipelineRef");
        engine.register_fn("pipeline", |index: INT| -> Result<PipelineRef, Box<EvalAltResult>> {
            usize::try_from(index)
                .map(PipelineRef::Index)
                .map_err(|_| format!("invalid pipeline index {index}").into())
        });
        engine.register_fn("pipeline", |name: &str| PipelineRef::Name(name.to_string()));
        engine
    }

    pub fn element_id(&self) -> &str {
        &self.element_id
    }

    /// Evaluate a mapping expression.
    pub fn eval_value(&self, value: &Value, index: u64) -> Result<Value, String> {
        let result = self.eval(Self::scope(Some(value), index))?;
        from_dynamic(result)
    }

    /// Evaluate a filter expression. Anything but a boolean is an error.
    pub fn eval_predicate(&self, value: &Value, index: u64) -> Result<bool, String> {
        let result = self.eval(Self::scope(Some(value), index))?;
        result
            .as_bool()
            .map_err(|actual| format!("filter expression must return a boolean, got {actual}"))
    }

    /// Evaluate a scan expression.
    pub fn eval_accumulator(&self, acc: &Value, value: &Value, index: u64) -> Result<Value, String> {
        let mut scope = Self::scope(Some(value), index);
        scope.push_dynamic("acc", to_dynamic(acc));
        from_dynamic(self.eval(scope)?)
    }

    /// Evaluate a projection. `value` is `None` at subscription time (defer).
    pub fn eval_projection(&self, value: Option<&Value>, index: u64) -> Result<PipelineRef, String> {
        let result = self.eval(Self::scope(value, index))?;
        let type_name = result.type_name();
        result
            .try_cast::<PipelineRef>()
            .ok_or_else(|| format!("projection must return pipeline(..), got {type_name}"))
    }

    fn scope(value: Option<&Value>, index: u64) -> Scope<'static> {
        let mut scope = Scope::new();
        scope.push_dynamic("value", value.map(to_dynamic).unwrap_or(Dynamic::UNIT));
        scope.push("index", index as INT);
        scope
    }

    fn eval(&self, mut scope: Scope<'static>) -> Result<Dynamic, String> {
        self.engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map_err(|err| {
                let message = runtime_message(*err);
                tracing::debug!(stage = %self.element_id, %message, "expression failed");
                message
            })
    }
}

/// The message a script failure is reported with. A thrown value is
/// reported as itself.
fn runtime_message(err: EvalAltResult) -> String {
    match err {
        EvalAltResult::ErrorRuntime(value, _) => value.to_string(),
        other => other.to_string(),
    }
}

fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Number(n) if n.fract() == 0.0 && n.abs() < (1u64 << 53) as f64 => {
            Dynamic::from_int(*n as INT)
        }
        Value::Number(n) => Dynamic::from_float(*n as FLOAT),
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => Dynamic::from_array(items.iter().map(to_dynamic).collect::<Array>()),
        Value::Object(map) => Dynamic::from_map(
            map.iter()
                .map(|(k, v)| (k.as_str().into(), to_dynamic(v)))
                .collect::<Map>(),
        ),
    }
}

fn from_dynamic(value: Dynamic) -> Result<Value, String> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(n) = value.as_int() {
        return Ok(Value::Number(n as f64));
    }
    if let Ok(n) = value.as_float() {
        return Ok(Value::Number(n as f64));
    }
    if let Ok(c) = value.as_char() {
        return Ok(Value::String(c.to_string()));
    }
    if value.is_string() {
        return value.into_string().map(Value::String).map_err(str::to_string);
    }
    if value.is_array() {
        let items = value.into_array().map_err(str::to_string)?;
        return items
            .into_iter()
            .map(from_dynamic)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array);
    }
    if value.is_map() {
        let type_name = value.type_name();
        let map = value
            .try_cast::<Map>()
            .ok_or_else(|| format!("unsupported result type {type_name}"))?;
        return map
            .into_iter()
            .map(|(k, v)| from_dynamic(v).map(|v| (k.to_string(), v)))
            .collect::<Result<_, _>>()
            .map(Value::Object);
    }
    Err(format!("unsupported result type {}", value.type_name()))
}
