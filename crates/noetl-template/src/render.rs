//! The renderer: `(template, context) -> value`.

use minijinja::value::Value as MjValue;
use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;

use crate::helpers::register_helpers;

/// Rendering failures. Carried into `action.error` events with
/// `kind = "template"`.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template error: {0}")]
    Render(#[from] minijinja::Error),

    #[error("template produced unserializable value: {0}")]
    Convert(#[from] serde_json::Error),
}

/// Stateless template renderer with the fixed helper table installed.
///
/// One instance is shared per process; rendering never mutates it.
pub struct Renderer {
    env: Environment<'static>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        register_helpers(&mut env);
        Self { env }
    }

    /// Evaluate a gate expression to a boolean, with template truthiness
    /// (empty strings, empty collections, zero, and none are false).
    ///
    /// Accepts either a bare expression (`true`, `x > 3`) or the braced
    /// form (`{{ ok('a') }}`).
    pub fn eval_bool(&self, expr: &str, ctx: &Value) -> Result<bool, TemplateError> {
        let inner = single_expression(expr).unwrap_or(expr.trim());
        let template = format!("{{% if {inner} %}}1{{% else %}}0{{% endif %}}");
        let rendered = self.env.render_str(&template, MjValue::from_serialize(ctx))?;
        Ok(rendered.trim() == "1")
    }

    /// Evaluate a bare expression to a typed JSON value. The expression
    /// result round-trips through `tojson`, so lists stay lists and
    /// numbers stay numbers.
    pub fn eval_expr(&self, expr: &str, ctx: &Value) -> Result<Value, TemplateError> {
        let inner = single_expression(expr).unwrap_or(expr.trim());
        let template = format!("{{{{ ({inner}) | tojson }}}}");
        let rendered = self.env.render_str(&template, MjValue::from_serialize(ctx))?;
        Ok(serde_json::from_str(&rendered)?)
    }

    /// Render one template string.
    ///
    /// A string that is exactly one `{{ expr }}` keeps the expression's
    /// type (lists stay lists, numbers stay numbers); anything else is
    /// rendered to a string.
    pub fn render_value(&self, template: &str, ctx: &Value) -> Result<Value, TemplateError> {
        if let Some(expr) = single_expression(template) {
            return self.eval_expr(expr, ctx);
        }
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(Value::String(template.to_string()));
        }
        let rendered = self.env.render_str(template, MjValue::from_serialize(ctx))?;
        Ok(Value::String(rendered))
    }

    /// Render every string inside a JSON value, recursing through maps
    /// and lists. Non-string scalars pass through untouched.
    pub fn render_deep(&self, value: &Value, ctx: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => self.render_value(s, ctx),
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_deep(v, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render_deep(v, ctx)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Evaluate the iterator expression of a loop to a JSON list.
    pub fn eval_sequence(&self, expr: &str, ctx: &Value) -> Result<Vec<Value>, TemplateError> {
        match self.eval_expr(expr, ctx)? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(vec![]),
            other => Ok(vec![other]),
        }
    }
}

/// If the string is exactly one `{{ expr }}`, return the inner expression.
fn single_expression(template: &str) -> Option<&str> {
    let t = template.trim();
    let inner = t.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
        return None;
    }
    Some(inner.trim())
}
