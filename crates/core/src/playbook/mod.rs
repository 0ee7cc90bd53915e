//! Playbook parsing, model and validation.

mod model;
mod validate;

pub use model::{
    ActionKind, CaseArm, DirectEdge, Edge, IterMode, JsonMap, KeychainEntry, Metadata, Playbook,
    PlaybookDoc, SaveBlock, StepDef, TaskDef,
};
pub use validate::{END_STEP, START_STEP};

use crate::error::EngineError;

/// A playbook that parsed and validated, along with non-fatal findings.
#[derive(Debug, Clone)]
pub struct ParsedPlaybook {
    pub playbook: Playbook,
    pub warnings: Vec<String>,
}

/// Parse and structurally validate a playbook document.
pub fn parse(text: &str) -> Result<ParsedPlaybook, EngineError> {
    let doc: PlaybookDoc = serde_yaml::from_str(text)
        .map_err(|e| EngineError::Validation(format!("invalid playbook document: {e}")))?;

    if doc.kind != "Playbook" {
        return Err(EngineError::Validation(format!(
            "unsupported kind `{}`; expected `Playbook`",
            doc.kind
        )));
    }
    if doc.api_version.is_empty() {
        return Err(EngineError::Validation("apiVersion must not be empty".into()));
    }

    let playbook = Playbook::from_doc(doc);
    let warnings = validate::validate(&playbook)?;
    Ok(ParsedPlaybook { playbook, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
apiVersion: playmill/v1
kind: Playbook
metadata:
  name: weather-sync
  path: demo/weather-sync
workload:
  base_url: "https://api.example.com"
  cities: ["amsterdam", "oslo"]
workbook:
  - name: fetch_city
    tool: http
    with:
      url: "{{ base_url }}/weather/{{ city }}"
  - name: store_row
    tool: postgres
    with:
      query: "INSERT INTO weather VALUES ($1)"
keychain:
  - name: api_token
    kind: bearer
    credential: weather_api
workflow:
  - step: start
    next: [fan_out]
  - step: fan_out
    tool: iterator
    collection: "{{ workload.cities }}"
    element: city
    mode: async
    task: fetch_city
    next: [summarize]
  - step: summarize
    tool: noop
    args:
      count: "{{ fan_out | length }}"
    vars:
      total: "{{ result.count }}"
    save:
      tool: postgres
      data:
        query: "INSERT INTO runs (total) VALUES ({{ this.data.count }})"
    next: [end]
  - step: end
"#;

    #[test]
    fn full_playbook_parses() {
        let parsed = parse(FULL).unwrap();
        let pb = &parsed.playbook;
        assert_eq!(pb.path, "demo/weather-sync");
        assert_eq!(pb.tasks.len(), 2);
        assert!(pb.step("fan_out").unwrap().collection.is_some());
        assert_eq!(pb.resolve_auth("api_token"), "weather_api");
        assert_eq!(pb.resolve_auth("unlisted"), "unlisted");
    }

    #[test]
    fn non_playbook_kind_is_rejected() {
        let text = FULL.replace("kind: Playbook", "kind: Recipe");
        assert!(parse(&text).is_err());
    }

    #[test]
    fn summary_lists_steps_and_tasks() {
        let parsed = parse(FULL).unwrap();
        let summary = parsed.playbook.summary();
        assert_eq!(summary["path"], "demo/weather-sync");
        assert_eq!(summary["steps"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn edge_shapes_deserialize() {
        let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workflow:
  - step: start
    next:
      - s1
      - step: s2
        args: {from: "start"}
  - step: s1
    tool: noop
    next:
      - when: "{{ s1.x > 3 }}"
        then: [end]
      - when: "{{ s1.x <= 3 }}"
        then: [s2]
  - step: s2
    tool: noop
    next: [end]
  - step: end
"#;
        let parsed = parse(text).unwrap();
        let start = parsed.playbook.step("start").unwrap();
        let next = start.next.as_ref().unwrap();
        assert!(matches!(next[0], Edge::Name(_)));
        assert!(matches!(next[1], Edge::Direct(_)));
        let s1 = parsed.playbook.step("s1").unwrap();
        assert!(s1.next.as_ref().unwrap().iter().all(Edge::is_conditional));
    }
}
