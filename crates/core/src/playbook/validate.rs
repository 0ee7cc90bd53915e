//! Structural validation of a parsed playbook.
//!
//! Errors fail registration; warnings are returned to the caller and
//! surfaced in the registration response.

use std::collections::HashSet;

use crate::error::EngineError;

use super::model::{ActionKind, Edge, Playbook, StepDef};

pub const START_STEP: &str = "start";
pub const END_STEP: &str = "end";

/// Validate the playbook, returning warnings on success.
pub fn validate(playbook: &Playbook) -> Result<Vec<String>, EngineError> {
    let mut warnings = Vec::new();

    if playbook.path.is_empty() {
        return Err(EngineError::Validation("metadata.path must not be empty".into()));
    }

    let mut seen = HashSet::new();
    for step in &playbook.steps {
        if !seen.insert(step.step.as_str()) {
            return Err(EngineError::Validation(format!(
                "duplicate step name: {}",
                step.step
            )));
        }
    }

    if playbook.step(START_STEP).is_none() {
        return Err(EngineError::Validation(format!(
            "workflow must contain a `{START_STEP}` step"
        )));
    }
    if playbook.step(END_STEP).is_none() {
        return Err(EngineError::Validation(format!(
            "workflow must contain an `{END_STEP}` step"
        )));
    }

    let mut task_names = HashSet::new();
    for task in playbook.tasks.values() {
        if !task_names.insert(task.name.as_str()) {
            return Err(EngineError::Validation(format!(
                "duplicate workbook task: {}",
                task.name
            )));
        }
        if task.tool.is_control_flow() {
            return Err(EngineError::Validation(format!(
                "workbook task `{}` may not use control-flow tool `{}`",
                task.name, task.tool
            )));
        }
    }

    let mut keychain_names = HashSet::new();
    for entry in &playbook.keychain {
        if !keychain_names.insert(entry.name.as_str()) {
            return Err(EngineError::Validation(format!(
                "duplicate keychain entry: {}",
                entry.name
            )));
        }
    }

    for step in &playbook.steps {
        validate_step(playbook, step, &mut warnings)?;
    }

    Ok(warnings)
}

fn validate_step(
    playbook: &Playbook,
    step: &StepDef,
    warnings: &mut Vec<String>,
) -> Result<(), EngineError> {
    let name = &step.step;

    if step.input_alias_count() > 1 {
        return Err(EngineError::Validation(format!(
            "step `{name}`: use only one of `args`, `data`, `with`"
        )));
    }
    if step.data.is_some() {
        warnings.push(format!(
            "step `{name}`: `data:` is a legacy alias for `args:`"
        ));
    }

    match (step.tool, &step.name) {
        // Iterator steps pair `tool: iterator` with a workbook `task`.
        (Some(ActionKind::Iterator), None) => {
            let task = step.task.as_deref().ok_or_else(|| {
                EngineError::Validation(format!("iterator step `{name}` requires `task`"))
            })?;
            if step.collection.is_none() || step.element.is_none() {
                return Err(EngineError::Validation(format!(
                    "iterator step `{name}` requires `collection` and `element`"
                )));
            }
            let inner = playbook.task(task).ok_or_else(|| {
                EngineError::Validation(format!(
                    "iterator step `{name}` references unknown task `{task}`"
                ))
            })?;
            if inner.tool.is_control_flow() {
                return Err(EngineError::Validation(format!(
                    "iterator step `{name}` may not iterate a `{}` task",
                    inner.tool
                )));
            }
        }
        (Some(ActionKind::Playbook), None) => {
            if step.path.is_none() {
                return Err(EngineError::Validation(format!(
                    "sub-playbook step `{name}` requires `path`"
                )));
            }
        }
        (Some(_), None) | (None, Some(_)) => {}
        (Some(_), Some(_)) => {
            return Err(EngineError::Validation(format!(
                "step `{name}`: `tool` and `name` are mutually exclusive"
            )));
        }
        // A step with neither is a pure router: it completes immediately
        // and only routes. `start` and `end` are usually routers.
        (None, None) => {}
    }

    if let Some(reference) = &step.name {
        if playbook.task(reference).is_none() {
            return Err(EngineError::Validation(format!(
                "step `{name}` references unknown task `{reference}`"
            )));
        }
    }

    if name == END_STEP && step.outgoing_edge_count() > 0 {
        return Err(EngineError::Validation(
            "`end` must not have outgoing routes".into(),
        ));
    }

    // When a `case` block is present, `next` serves only as the
    // unconditional fallback; conditional edges there would create two
    // competing dispatch orders.
    if step.case.is_some() {
        if let Some(next) = &step.next {
            if next.iter().any(Edge::is_conditional) {
                return Err(EngineError::Validation(format!(
                    "step `{name}`: conditional `next` edges are not allowed alongside `case`"
                )));
            }
        }
    }

    for target in step
        .next
        .iter()
        .flatten()
        .flat_map(Edge::targets)
        .chain(step.case.iter().flatten().flat_map(|arm| {
            arm.then.iter().map(String::as_str)
        }))
    {
        if playbook.step(target).is_none() {
            return Err(EngineError::UnknownStep(format!(
                "step `{name}` routes to unknown step `{target}`"
            )));
        }
    }

    if let Some(return_step) = &step.return_step {
        if step.tool != Some(ActionKind::Playbook) {
            return Err(EngineError::Validation(format!(
                "step `{name}`: `return_step` is only valid on sub-playbook steps ({return_step})"
            )));
        }
    }

    if name != END_STEP
        && step.outgoing_edge_count() == 0
        && step.tool != Some(ActionKind::Playbook)
    {
        warnings.push(format!(
            "step `{name}` has no outgoing routes; the execution will stall there unless it is a dead end on purpose"
        ));
    }

    if let Some(save) = &step.save {
        if save.tool.is_control_flow() {
            return Err(EngineError::Validation(format!(
                "step `{name}`: save block may not use `{}`",
                save.tool
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::playbook::parse;

    const MINIMAL: &str = r#"
apiVersion: playmill/v1
kind: Playbook
metadata:
  name: minimal
  path: tests/minimal
workflow:
  - step: start
    next:
      - end
  - step: end
"#;

    #[test]
    fn minimal_playbook_validates() {
        let parsed = parse(MINIMAL).unwrap();
        assert!(parsed.warnings.is_empty());
        assert_eq!(parsed.playbook.steps.len(), 2);
    }

    #[test]
    fn missing_start_is_rejected() {
        let text = MINIMAL.replace("step: start", "step: begin");
        let err = parse(&text).unwrap_err();
        assert!(err.to_string().contains("start"), "{err}");
    }

    #[test]
    fn end_with_routes_is_rejected() {
        let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workflow:
  - step: start
    next: [end]
  - step: end
    next: [start]
"#;
        let err = parse(text).unwrap_err();
        assert!(err.to_string().contains("outgoing"), "{err}");
    }

    #[test]
    fn unknown_route_target_is_rejected() {
        let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workflow:
  - step: start
    next: [missing]
  - step: end
"#;
        let err = parse(text).unwrap_err();
        assert!(err.to_string().contains("missing"), "{err}");
    }

    #[test]
    fn tool_and_name_are_mutually_exclusive() {
        let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workbook:
  - name: fetch
    tool: http
    with: {url: "http://example.com"}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: noop
    name: fetch
    next: [end]
  - step: end
"#;
        let err = parse(text).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"), "{err}");
    }

    #[test]
    fn data_alias_warns() {
        let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: noop
    data: {value: 1}
    next: [end]
  - step: end
"#;
        let parsed = parse(text).unwrap();
        assert!(parsed.warnings.iter().any(|w| w.contains("legacy alias")));
    }

    #[test]
    fn conditional_next_with_case_is_rejected() {
        let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: noop
    case:
      - when: "{{ s1.x > 1 }}"
        then: [end]
    next:
      - when: "{{ s1.x < 1 }}"
        then: [end]
  - step: end
"#;
        let err = parse(text).unwrap_err();
        assert!(err.to_string().contains("alongside `case`"), "{err}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = MINIMAL.replace("workflow:", "wrokflow_typo: []\nworkflow:");
        assert!(parse(&text).is_err());
    }

    #[test]
    fn iterator_requires_collection_and_task() {
        let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workbook:
  - name: inner
    tool: noop
workflow:
  - step: start
    next: [fan]
  - step: fan
    tool: iterator
    task: inner
    next: [end]
  - step: end
"#;
        let err = parse(text).unwrap_err();
        assert!(err.to_string().contains("collection"), "{err}");
    }
}
