//! The fixed helper table available inside templates.
//!
//! Step predicates read the read-only `step` namespace injected by the
//! context builder; they never mutate it.

use std::collections::HashSet;

use minijinja::value::Value;
use minijinja::{Environment, Error, ErrorKind, State};

/// Register every helper on the environment.
pub fn register_helpers(env: &mut Environment<'_>) {
    env.add_function("done", done);
    env.add_function("ok", ok);
    env.add_function("fail", fail);
    env.add_function("running", running);
    env.add_function("loop_done", loop_done);
    env.add_function("all_done", all_done);
    env.add_function("any_done", any_done);
    env.add_function("now", now);
    env.add_function("uuid", uuid_fn);
    env.add_function("env", env_fn);
}

fn status_field(state: &State, id: &str, field: &str) -> Result<Value, Error> {
    let steps = state.lookup("step").unwrap_or_else(Value::default);
    let entry = steps.get_attr(id)?;
    if entry.is_undefined() {
        return Ok(Value::from(false));
    }
    let status = entry.get_attr("status")?;
    status.get_attr(field)
}

fn status_bool(state: &State, id: &str, field: &str) -> Result<bool, Error> {
    Ok(status_field(state, id, field)?.is_true())
}

/// `done(id)`: the step reached any terminal state.
fn done(state: &State, id: String) -> Result<bool, Error> {
    status_bool(state, &id, "done")
}

/// `ok(id)`: the step completed successfully.
fn ok(state: &State, id: String) -> Result<bool, Error> {
    status_bool(state, &id, "ok")
}

/// `fail(id)`: at least one attempt/iteration of the step failed terminally.
fn fail(state: &State, id: String) -> Result<bool, Error> {
    let failed = status_field(state, &id, "failed")?;
    Ok(i64::try_from(failed.clone()).map(|n| n > 0).unwrap_or(failed.is_true()))
}

/// `running(id)`: the step has started but not reached a terminal state.
fn running(state: &State, id: String) -> Result<bool, Error> {
    status_bool(state, &id, "running")
}

/// `loop_done(id)`: every iteration of the loop step is terminal.
fn loop_done(state: &State, id: String) -> Result<bool, Error> {
    if !status_bool(state, &id, "done")? {
        return Ok(false);
    }
    let total = status_field(state, &id, "total")?;
    let completed = status_field(state, &id, "completed")?;
    match (i64::try_from(total), i64::try_from(completed)) {
        (Ok(t), Ok(c)) => Ok(t == c),
        _ => Ok(true),
    }
}

/// `all_done([ids])`: every listed step is terminal.
fn all_done(state: &State, ids: Vec<String>) -> Result<bool, Error> {
    for id in ids {
        if !status_bool(state, &id, "done")? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// `any_done([ids])`: at least one listed step is terminal.
fn any_done(state: &State, ids: Vec<String>) -> Result<bool, Error> {
    for id in ids {
        if status_bool(state, &id, "done")? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `now()`: current UTC timestamp, RFC 3339.
fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// `uuid()`: fresh time-ordered UUID.
fn uuid_fn() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// `env(name)`: process environment variable, or none.
fn env_fn(name: String) -> Result<Value, Error> {
    match std::env::var(&name) {
        Ok(v) => Ok(Value::from(v)),
        Err(std::env::VarError::NotPresent) => Ok(Value::from(())),
        Err(e) => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("env({name}): {e}"),
        )),
    }
}

const STEP_PREDICATES: [&str; 5] = ["done", "ok", "fail", "running", "loop_done"];
const LIST_PREDICATES: [&str; 2] = ["all_done", "any_done"];

/// Extract the step ids a gate expression refers to through helper calls.
///
/// Used to index parked calls so a terminal event for step `X` only wakes
/// the gates that mention `X`.
pub fn gate_refs(expr: &str) -> HashSet<String> {
    let mut refs = HashSet::new();
    for name in STEP_PREDICATES.iter().chain(LIST_PREDICATES.iter()) {
        let mut rest = expr;
        while let Some(pos) = rest.find(name) {
            let after = &rest[pos + name.len()..];
            // Require a call, not a substring of a longer identifier.
            let preceding_ok = rest[..pos]
                .chars()
                .next_back()
                .map(|c| !c.is_alphanumeric() && c != '_')
                .unwrap_or(true);
            if preceding_ok {
                if let Some(args) = call_args(after) {
                    for id in quoted_strings(args) {
                        refs.insert(id);
                    }
                }
            }
            rest = &rest[pos + name.len()..];
        }
    }
    refs
}

fn call_args(after_name: &str) -> Option<&str> {
    let trimmed = after_name.trim_start();
    if !trimmed.starts_with('(') {
        return None;
    }
    let close = trimmed.find(')')?;
    Some(&trimmed[1..close])
}

fn quoted_strings(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = args.char_indices();
    while let Some((start, c)) = chars.next() {
        if c == '\'' || c == '"' {
            if let Some(end) = args[start + 1..].find(c) {
                out.push(args[start + 1..start + 1 + end].to_string());
                // Skip past the closing quote.
                for _ in 0..end + 1 {
                    chars.next();
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_refs_single() {
        let refs = gate_refs("{{ ok('fetch_user') }}");
        assert_eq!(refs, HashSet::from(["fetch_user".to_string()]));
    }

    #[test]
    fn test_gate_refs_conjunction() {
        let refs = gate_refs("{{ done('a') and ok(\"b\") }}");
        assert!(refs.contains("a"));
        assert!(refs.contains("b"));
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn test_gate_refs_list_helpers() {
        let refs = gate_refs("{{ all_done(['x', 'y']) or any_done(['z']) }}");
        assert_eq!(refs.len(), 3);
        assert!(refs.contains("x") && refs.contains("y") && refs.contains("z"));
    }

    #[test]
    fn test_gate_refs_ignores_plain_expressions() {
        assert!(gate_refs("{{ workload.count > 3 }}").is_empty());
        assert!(gate_refs("true").is_empty());
    }

    #[test]
    fn test_gate_refs_ignores_longer_identifiers() {
        // `redone('x')` must not register as a `done` reference.
        assert!(gate_refs("{{ redone('x') }}").is_empty());
    }
}
