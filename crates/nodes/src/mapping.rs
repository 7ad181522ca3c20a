//! Data mapping: build a new object from `data` using per-field rules.
//!
//! A rule is one of:
//! - a template string (contains `{{`), resolved against the context;
//! - a field name or dot-path into `data`;
//! - a structured rule object tagged by `type`
//!   (`concat`, `format_date`, `uppercase`, `lowercase`, `default`);
//! - any other JSON value, copied literally.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::context::ExecutionContext;
use crate::value::{lookup_dotted, render};

fn default_date_format() -> String {
    "%Y-%m-%d".to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StructuredRule {
    Concat {
        #[serde(default)]
        fields: Vec<String>,
        #[serde(default)]
        values: Vec<Value>,
        #[serde(default)]
        separator: String,
    },
    FormatDate {
        field: String,
        #[serde(default = "default_date_format")]
        format: String,
    },
    Uppercase {
        field: String,
    },
    Lowercase {
        field: String,
    },
    Default {
        field: String,
        value: Value,
    },
}

impl ExecutionContext {
    /// Apply `rules` to `data`, producing a new object.  `data` is not
    /// modified.
    pub fn transform(&self, data: &Value, rules: &Map<String, Value>) -> Value {
        let mut out = Map::with_capacity(rules.len());
        for (target, rule) in rules {
            out.insert(target.clone(), self.apply_rule(data, rule));
        }
        Value::Object(out)
    }

    fn apply_rule(&self, data: &Value, rule: &Value) -> Value {
        match rule {
            Value::String(s) if s.contains("{{") => Value::String(self.resolve_template(s)),
            Value::String(path) => field(data, path).cloned().unwrap_or(Value::Null),
            Value::Object(obj) if obj.contains_key("type") => {
                match serde_json::from_value::<StructuredRule>(rule.clone()) {
                    Ok(structured) => self.apply_structured(data, structured),
                    Err(e) => {
                        warn!(error = %e, "unrecognised mapping rule, copying literally");
                        rule.clone()
                    }
                }
            }
            other => other.clone(),
        }
    }

    fn apply_structured(&self, data: &Value, rule: StructuredRule) -> Value {
        match rule {
            StructuredRule::Concat {
                fields,
                values,
                separator,
            } => {
                let from_fields = fields
                    .iter()
                    .filter_map(|f| field(data, f))
                    .filter(|v| !v.is_null())
                    .map(render);
                let from_values = values.iter().map(|v| match v {
                    Value::String(s) => self.resolve_template(s),
                    other => render(other),
                });
                let parts: Vec<String> = from_fields.chain(from_values).collect();
                Value::String(parts.join(&separator))
            }
            StructuredRule::FormatDate { field: name, format } => field(data, &name)
                .and_then(parse_date)
                .and_then(|dt| format_date(&dt, &format))
                .map(Value::String)
                .unwrap_or(Value::Null),
            StructuredRule::Uppercase { field: name } => {
                map_string(field(data, &name), str::to_uppercase)
            }
            StructuredRule::Lowercase { field: name } => {
                map_string(field(data, &name), str::to_lowercase)
            }
            StructuredRule::Default { field: name, value } => match field(data, &name) {
                Some(v) if !v.is_null() => v.clone(),
                _ => value,
            },
        }
    }
}

/// Exact key first, then dot-path.
fn field<'a>(data: &'a Value, name: &str) -> Option<&'a Value> {
    data.get(name).or_else(|| lookup_dotted(data, name))
}

fn map_string(value: Option<&Value>, f: fn(&str) -> String) -> Value {
    match value {
        Some(Value::String(s)) => Value::String(f(s)),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => DateTime::from_timestamp_millis(n.as_i64()?),
        _ => None,
    }
}

fn format_date(dt: &DateTime<Utc>, format: &str) -> Option<String> {
    let mut out = String::new();
    write!(out, "{}", dt.format(format)).ok()?;
    Some(out)
}
