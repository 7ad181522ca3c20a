//! `{{ ... }}` template interpolation.
//!
//! - `{{node.<id>.<path>}}` reads a dot-path inside a node's output.
//! - `{{name}}` reads a variable by its exact name.
//!
//! A marker that does not resolve is left in the text verbatim.

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::value::{lookup_path, render};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

impl ExecutionContext {
    /// Replace every resolvable `{{expr}}` marker in `text`.
    pub fn resolve_template(&self, text: &str) -> String {
        interpolate(text, |expr| self.resolve_expression(expr))
    }

    /// Resolve every string leaf of a JSON value.  Non-string leaves and
    /// object keys are left untouched.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) if s.contains(OPEN) => Value::String(self.resolve_template(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_expression(&self, expr: &str) -> Option<String> {
        if let Some(rest) = expr.strip_prefix("node.") {
            let mut segments = rest.split('.');
            let node_id = segments.next().filter(|id| !id.is_empty())?;
            let output = self.get_node_output(node_id)?;
            return lookup_path(output, segments).map(render);
        }

        self.variable(expr).map(|v| render(&v.value))
    }
}

/// Scan `text` for markers and substitute what `resolve` returns.
fn interpolate<F>(text: &str, resolve: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];

        let Some(end) = after_open.find(CLOSE) else {
            // Unterminated marker: keep the remainder as-is.
            out.push_str(&rest[start..]);
            return out;
        };

        let marker = &rest[start..start + OPEN.len() + end + CLOSE.len()];
        match resolve(after_open[..end].trim()) {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(marker),
        }
        rest = &after_open[end + CLOSE.len()..];
    }

    out.push_str(rest);
    out
}
