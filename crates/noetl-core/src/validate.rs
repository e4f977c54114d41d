//! Registration-time playbook validation.
//!
//! Validation failures surface synchronously on registration or execution
//! start and are never retried.

use std::collections::HashSet;

use crate::playbook::Playbook;
use crate::{CoreError, START_STEP, STEP_NAMESPACE};

/// Validate a parsed playbook. Returns the list of problems, empty on
/// success; `validate_playbook` wraps this into a `CoreError`.
pub fn check_playbook(playbook: &Playbook) -> Vec<String> {
    let mut problems = Vec::new();

    if playbook.workflow.is_empty() {
        problems.push("workflow must declare at least one step".to_string());
        return problems;
    }

    if !playbook.has_start_step() {
        problems.push(format!("workflow must declare a '{START_STEP}' step"));
    }

    let mut seen = HashSet::new();
    for step in &playbook.workflow {
        if step.step.is_empty() {
            problems.push("step id must not be empty".to_string());
            continue;
        }
        if !seen.insert(step.step.as_str()) {
            problems.push(format!("duplicate step id '{}'", step.step));
        }
    }

    let ids: HashSet<&str> = playbook.workflow.iter().map(|s| s.step.as_str()).collect();

    for step in &playbook.workflow {
        if let Some(bind) = &step.bind {
            for name in bind.keys() {
                if name == STEP_NAMESPACE || name.starts_with("step.") {
                    problems.push(format!(
                        "step '{}': bind writes to reserved name '{}'",
                        step.step, name
                    ));
                }
            }
        }

        if let Some(lp) = &step.loop_spec {
            if lp.iterator == STEP_NAMESPACE {
                problems.push(format!(
                    "step '{}': loop iterator shadows reserved name '{STEP_NAMESPACE}'",
                    step.step
                ));
            }
            if lp.iterator.is_empty() {
                problems.push(format!("step '{}': loop iterator must be named", step.step));
            }
            if let Some(0) = lp.parallelism {
                problems.push(format!(
                    "step '{}': loop parallelism must be at least 1",
                    step.step
                ));
            }
        }

        if let Some(edges) = &step.next {
            for edge in edges {
                for target in edge.step.targets() {
                    if !ids.contains(target) {
                        problems.push(format!(
                            "step '{}': next targets unknown step '{}'",
                            step.step, target
                        ));
                    }
                }
            }
        }

        if let Some(tool) = &step.tool {
            if tool.kind.is_empty() {
                problems.push(format!("step '{}': tool.kind must not be empty", step.step));
            }
            if let Some(retry) = &tool.retry {
                if retry.max_attempts == 0 {
                    problems.push(format!(
                        "step '{}': retry.max_attempts must be at least 1",
                        step.step
                    ));
                }
            }
            if let Some(result) = &tool.result {
                if let Some(name) = &result.name {
                    if name == STEP_NAMESPACE || name.starts_with("step.") {
                        problems.push(format!(
                            "step '{}': result.as writes to reserved name '{}'",
                            step.step, name
                        ));
                    }
                }
                if let Some(collect) = &result.collect {
                    if collect.into == STEP_NAMESPACE {
                        problems.push(format!(
                            "step '{}': collect.into writes to reserved name '{STEP_NAMESPACE}'",
                            step.step
                        ));
                    }
                }
            }
        }
    }

    problems
}

/// Validate, collapsing all problems into one error.
pub fn validate_playbook(playbook: &Playbook) -> Result<(), CoreError> {
    let problems = check_playbook(playbook);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(CoreError::Validation(problems.join("; ")))
    }
}
