//! Template interpolation and condition evaluation over an execution's variables.
//!
//! Templates use `{{ path }}` placeholders where `path` is a dotted walk into
//! the variables map (`user.name`, `items.0.sku`). Conditions are a small
//! comparison language:
//!
//! - `{{plan}} == 'pro'` / `plan != "free"` -- compare against a quoted literal
//! - `{{a}} == {{b}}` -- compare two references
//! - `{{count}} == 3`, `{{opted_in}} == true` -- compare against an unquoted literal
//! - `{{opted_in}}` -- bare truthiness
//!
//! A comparison whose left-hand side references a missing variable is
//! `false` for both operators. Malformed expressions never abort a run:
//! they are logged and evaluate to `false`.

use parley_types::config::UnresolvedTemplatePolicy;
use parley_types::workflow::Variables;
use serde_json::{Map, Value};

use super::error::WorkflowError;

// ---------------------------------------------------------------------------
// VariableResolver
// ---------------------------------------------------------------------------

/// Resolves templates and conditions against a variables map.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariableResolver {
    unresolved: UnresolvedTemplatePolicy,
}

impl VariableResolver {
    pub fn new(unresolved: UnresolvedTemplatePolicy) -> Self {
        Self { unresolved }
    }

    /// Replace every `{{ path }}` placeholder in `template`.
    ///
    /// Strings render raw, scalars via their JSON form, objects and arrays as
    /// compact JSON, and `null` as empty. An unterminated `{{` is copied
    /// through verbatim.
    pub fn resolve_content(&self, template: &str, variables: &Variables) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            out.push_str(&rest[..start]);
            let placeholder = &rest[start..start + 2 + len + 2];
            let path = rest[start + 2..start + 2 + len].trim();

            match lookup(variables, path) {
                Some(value) => out.push_str(&render_value(value)),
                None => {
                    tracing::debug!(path, "template placeholder did not resolve");
                    if self.unresolved == UnresolvedTemplatePolicy::Keep {
                        out.push_str(placeholder);
                    }
                }
            }
            rest = &rest[start + placeholder.len()..];
        }

        out.push_str(rest);
        out
    }

    /// Resolve every string inside `value`, recursing into arrays and objects.
    ///
    /// A string that is exactly one placeholder (`"{{ order }}"`) resolves to
    /// the referenced value itself so structured data survives into action
    /// params. Any other string is interpolated as text.
    pub fn resolve_value(&self, value: &Value, variables: &Variables) -> Value {
        match value {
            Value::String(s) => {
                if let Some(path) = sole_placeholder(s) {
                    if let Some(found) = lookup(variables, path) {
                        return found.clone();
                    }
                }
                Value::String(self.resolve_content(s, variables))
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item, variables))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v, variables)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Evaluate a condition, treating malformed expressions as `false`.
    pub fn evaluate_condition(&self, expr: &str, variables: &Variables) -> bool {
        match try_evaluate_condition(expr, variables) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(expression = expr, error = %e, "condition evaluated to false");
                false
            }
        }
    }
}

/// Resolve a template with the default (`empty`) unresolved-placeholder policy.
pub fn resolve_content(template: &str, variables: &Variables) -> String {
    VariableResolver::default().resolve_content(template, variables)
}

/// Evaluate a condition with malformed expressions treated as `false`.
pub fn evaluate_condition(expr: &str, variables: &Variables) -> bool {
    VariableResolver::default().evaluate_condition(expr, variables)
}

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand<'a> {
    Reference(&'a str),
    Literal(Value),
}

impl Operand<'_> {
    fn resolve<'v>(&'v self, variables: &'v Variables) -> Option<&'v Value> {
        match self {
            Operand::Reference(path) => lookup(variables, path),
            Operand::Literal(value) => Some(value),
        }
    }
}

/// Evaluate a condition, reporting malformed expressions as errors.
pub fn try_evaluate_condition(expr: &str, variables: &Variables) -> Result<bool, WorkflowError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(WorkflowError::ConditionEvaluationError(
            "empty condition".to_string(),
        ));
    }

    let Some((lhs, op, rhs)) = split_comparison(expr)? else {
        let operand = parse_operand(expr, true)?;
        return Ok(operand.resolve(variables).is_some_and(is_truthy));
    };

    let lhs = parse_operand(lhs, true)?;
    let rhs = parse_operand(rhs, false)?;

    let Some(left) = lhs.resolve(variables) else {
        return Ok(false);
    };
    let Some(right) = rhs.resolve(variables) else {
        return Ok(false);
    };

    let equal = loosely_equal(left, right);
    Ok(match op {
        Operator::Eq => equal,
        Operator::Ne => !equal,
    })
}

/// Split `lhs OP rhs` on the first `==`/`!=` outside quotes.
fn split_comparison(expr: &str) -> Result<Option<(&str, Operator, &str)>, WorkflowError> {
    let bytes = expr.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if (b == b'=' || b == b'!') && bytes.get(i + 1) == Some(&b'=') => {
                let op = if b == b'=' { Operator::Eq } else { Operator::Ne };
                let lhs = expr[..i].trim();
                let rhs = expr[i + 2..].trim();
                if lhs.is_empty() || rhs.is_empty() {
                    return Err(WorkflowError::ConditionEvaluationError(format!(
                        "dangling operator in '{expr}'"
                    )));
                }
                return Ok(Some((lhs, op, rhs)));
            }
            None => {}
        }
        i += 1;
    }

    if quote.is_some() {
        return Err(WorkflowError::ConditionEvaluationError(format!(
            "unterminated quote in '{expr}'"
        )));
    }
    Ok(None)
}

/// Parse one side of a comparison.
///
/// On the left, an unquoted word is a variable path. On the right it is a
/// JSON scalar (`true`, `42`, `null`) if it parses as one, otherwise a path.
fn parse_operand(raw: &str, is_lhs: bool) -> Result<Operand<'_>, WorkflowError> {
    if let Some(inner) = raw.strip_prefix("{{") {
        let path = inner.strip_suffix("}}").ok_or_else(|| {
            WorkflowError::ConditionEvaluationError(format!("unterminated placeholder '{raw}'"))
        })?;
        let path = path.trim();
        if !is_path(path) {
            return Err(WorkflowError::ConditionEvaluationError(format!(
                "invalid variable reference '{raw}'"
            )));
        }
        return Ok(Operand::Reference(path));
    }

    for q in ['\'', '"'] {
        if let Some(inner) = raw.strip_prefix(q) {
            let literal = inner.strip_suffix(q).ok_or_else(|| {
                WorkflowError::ConditionEvaluationError(format!("unterminated quote in '{raw}'"))
            })?;
            return Ok(Operand::Literal(Value::String(literal.to_string())));
        }
    }

    if !is_lhs {
        if let Ok(scalar @ (Value::Bool(_) | Value::Number(_) | Value::Null)) =
            serde_json::from_str::<Value>(raw)
        {
            return Ok(Operand::Literal(scalar));
        }
    }

    if is_path(raw) {
        Ok(Operand::Reference(raw))
    } else {
        Err(WorkflowError::ConditionEvaluationError(format!(
            "cannot parse operand '{raw}'"
        )))
    }
}

fn is_path(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        })
}

/// Equality with string coercion: `3 == '3'` and `true == 'true'` hold,
/// numbers compare numerically.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(s), other) | (other, Value::String(s)) => {
            !matches!(other, Value::Array(_) | Value::Object(_)) && render_value(other) == *s
        }
        (a, b) => a == b,
    }
}

/// Truthiness used by bare conditions.
///
/// Falsy: `null`, `false`, `0`, `""`, `[]`, `{}`, and the strings `"false"`,
/// `"0"`, `"no"` (case-insensitive).
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let s = s.trim();
            !(s.is_empty()
                || s == "0"
                || s.eq_ignore_ascii_case("false")
                || s.eq_ignore_ascii_case("no"))
        }
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Path access
// ---------------------------------------------------------------------------

/// Look up a dotted path. Object segments match keys, array segments are
/// numeric indices. A top-level key containing dots matches before any walk.
pub fn lookup<'a>(variables: &'a Variables, path: &str) -> Option<&'a Value> {
    if let Some(value) = variables.get(path) {
        return Some(value);
    }
    let mut segments = path.split('.');
    let mut current = variables.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Return a copy of `variables` with `name` set to `value`.
///
/// Dotted names create or extend nested objects; a non-object in the way is
/// replaced.
pub fn set_variable(variables: &Variables, name: &str, value: Value) -> Variables {
    let mut updated = variables.clone();
    apply_variable(&mut updated, name, value);
    updated
}

/// In-place form of [`set_variable`].
pub fn apply_variable(variables: &mut Variables, name: &str, value: Value) {
    let Some((head, tail)) = name.split_once('.') else {
        variables.insert(name.to_string(), value);
        return;
    };

    let root = variables
        .entry(head.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let segments: Vec<&str> = tail.split('.').collect();
    insert_path(root, &segments, value);
}

/// Apply a batch of writes in a fixed order: shallower paths first, then by
/// name. A dotted write (`profile.tier`) therefore always lands on top of a
/// whole-object write to its root (`profile`), whatever order the map yields.
pub fn apply_variables(variables: &mut Variables, updates: &Variables) {
    let mut ordered: Vec<(&String, &Value)> = updates.iter().collect();
    ordered.sort_by(|(a, _), (b, _)| {
        a.matches('.')
            .count()
            .cmp(&b.matches('.').count())
            .then_with(|| a.cmp(b))
    });
    for (name, value) in ordered {
        apply_variable(variables, name, value.clone());
    }
}

fn insert_path(target: &mut Value, segments: &[&str], value: Value) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return;
    };
    match segments {
        [] => {}
        [last] => {
            map.insert((*last).to_string(), value);
        }
        [first, rest @ ..] => {
            let child = map
                .entry((*first).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            insert_path(child, rest, value);
        }
    }
}

// ---------------------------------------------------------------------------
// Reference extraction (lint)
// ---------------------------------------------------------------------------

/// Paths of every `{{ path }}` placeholder in `template`.
pub fn template_references(template: &str) -> Vec<&str> {
    let mut refs = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let path = rest[start + 2..start + 2 + len].trim();
        if !path.is_empty() {
            refs.push(path);
        }
        rest = &rest[start + 2 + len + 2..];
    }
    refs
}

/// Variable paths a condition reads, or an error if it is malformed.
pub fn condition_references(expr: &str) -> Result<Vec<&str>, WorkflowError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(WorkflowError::ConditionEvaluationError(
            "empty condition".to_string(),
        ));
    }
    let operands = match split_comparison(expr)? {
        Some((lhs, _, rhs)) => vec![parse_operand(lhs, true)?, parse_operand(rhs, false)?],
        None => vec![parse_operand(expr, true)?],
    };
    Ok(operands
        .into_iter()
        .filter_map(|op| match op {
            Operand::Reference(path) => Some(path),
            Operand::Literal(_) => None,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Render a value as template text.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// The path of a string that consists of a single placeholder and nothing else.
fn sole_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
