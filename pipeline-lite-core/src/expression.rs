//! Step parameter rendering.
//!
//! Strings in step parameters may carry `<+input.KEY>` and
//! `<+outcome.NAME.path.to.field>` placeholders. A string that is exactly one
//! placeholder is replaced by the referenced JSON value (keeping its type);
//! placeholders embedded in longer strings are spliced in as text.

use crate::error::EngineError;
use anyhow::{anyhow, Result};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

const PLACEHOLDER: &str = r"<\+(input|outcome)\.([A-Za-z0-9_\-]+)((?:\.[A-Za-z0-9_\-]+)*)>";

/// Values placeholders resolve against.
#[derive(Clone, Debug, Default)]
pub struct ExpressionContext {
    pub inputs: BTreeMap<String, Value>,
    pub outcomes: BTreeMap<String, Value>,
}

pub struct ExpressionRenderer {
    pattern: Regex,
    whole: Regex,
}

impl ExpressionRenderer {
    pub fn new() -> Result<Self> {
        let pattern =
            Regex::new(PLACEHOLDER).map_err(|e| anyhow!("Bad placeholder pattern: {}", e))?;
        let whole = Regex::new(&format!("^{}$", PLACEHOLDER))
            .map_err(|e| anyhow!("Bad placeholder pattern: {}", e))?;
        Ok(Self { pattern, whole })
    }

    /// Outcome names referenced anywhere in `value`.
    pub fn referenced_outcomes(&self, value: &Value) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_outcomes(value, &mut names);
        names
    }

    fn collect_outcomes(&self, value: &Value, names: &mut BTreeSet<String>) {
        match value {
            Value::String(s) => {
                for caps in self.pattern.captures_iter(s) {
                    if &caps[1] == "outcome" {
                        names.insert(caps[2].to_string());
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|v| self.collect_outcomes(v, names)),
            Value::Object(map) => map.values().for_each(|v| self.collect_outcomes(v, names)),
            _ => {}
        }
    }

    pub fn render(&self, value: &Value, ctx: &ExpressionContext) -> Result<Value> {
        match value {
            Value::String(s) => self.render_str(s, ctx),
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|v| self.render(v, ctx))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render(v, ctx)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn render_str(&self, s: &str, ctx: &ExpressionContext) -> Result<Value> {
        if let Some(caps) = self.whole.captures(s) {
            return Ok(lookup(&caps, ctx)?.clone());
        }
        let mut failure = None;
        let rendered = self.pattern.replace_all(s, |caps: &Captures| match lookup(caps, ctx) {
            Ok(Value::String(text)) => text.clone(),
            Ok(other) => other.to_string(),
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(Value::String(rendered.into_owned())),
        }
    }
}

fn lookup<'a>(caps: &Captures, ctx: &'a ExpressionContext) -> Result<&'a Value> {
    let source = if &caps[1] == "input" {
        &ctx.inputs
    } else {
        &ctx.outcomes
    };
    let mut current = source.get(&caps[2]);
    for segment in caps[3].split('.').filter(|s| !s.is_empty()) {
        current = current.and_then(|v| match v {
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => v.get(segment),
        });
    }
    current.ok_or_else(|| {
        EngineError::Expression(format!("unresolved expression '{}'", &caps[0])).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExpressionContext {
        let mut ctx = ExpressionContext::default();
        ctx.inputs.insert("env".into(), json!("prod"));
        ctx.inputs.insert("replicas".into(), json!(3));
        ctx.outcomes
            .insert("build".into(), json!({"image": {"tag": "v1.2"}, "digests": ["sha256:aa"]}));
        ctx
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let r = ExpressionRenderer::new().unwrap();
        let out = r
            .render(&json!({"count": "<+input.replicas>"}), &ctx())
            .unwrap();
        assert_eq!(out, json!({"count": 3}));
    }

    #[test]
    fn test_embedded_placeholders_and_paths() {
        let r = ExpressionRenderer::new().unwrap();
        let out = r
            .render(
                &json!([
                    "deploy <+outcome.build.image.tag> to <+input.env>",
                    "<+outcome.build.digests.0>"
                ]),
                &ctx(),
            )
            .unwrap();
        assert_eq!(out, json!(["deploy v1.2 to prod", "sha256:aa"]));
    }

    #[test]
    fn test_unresolved_is_expression_error() {
        let r = ExpressionRenderer::new().unwrap();
        let err = r.render(&json!("x <+input.missing>"), &ctx()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Expression(_))
        ));
    }

    #[test]
    fn test_referenced_outcomes() {
        let r = ExpressionRenderer::new().unwrap();
        let names = r.referenced_outcomes(&json!({
            "a": "<+outcome.build.image>",
            "b": ["<+outcome.test.report> and <+input.env>"],
        }));
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["build".to_string(), "test".to_string()]
        );
    }
}
